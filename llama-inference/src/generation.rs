#[cfg(test)]
#[path = "../tests/unit/generation_test.rs"]
mod generation_test;

use crate::InferenceConfig;
use crate::chat::{ChatFormat, Message, Role};
use crate::layers::InferenceState;
use crate::models::Transformer;
use crate::sampler::Sampler;
use crate::tokenizer::{Tokenizer, replace_control_characters};
use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::time::{Duration, Instant};

/// Input of one [`generate_tokens`] call.
pub struct GenerationRequest<'r> {
    /// Position of `InferenceState::latest_token`, the first token fed to the model.
    pub start_position: usize,
    /// Tokens forced after the latest token, without consulting the sampler.
    pub prompt_tokens: &'r [usize],
    pub stop_tokens: &'r HashSet<usize>,
    /// Exclusive upper bound on positions; `None` or anything past the context length means the context length.
    pub max_tokens: Option<usize>,
    /// Writes every ingested and sampled token to stderr when set.
    pub echo: Option<&'r dyn Tokenizer>,
}

/// Tracks token generation performance metrics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub elapsed: Duration,
}

impl GenerationStats {
    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens + self.generated_tokens
    }

    pub fn tokens_per_second(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 { self.total_tokens() as f64 / seconds } else { 0.0 }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    /// Decoded reply without the trailing stop token.
    pub content: String,
    /// Whether a stop token ended the reply rather than the position bound.
    pub stopped: bool,
    pub stats: GenerationStats,
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Sampled tokens, ending with the stop token when one was produced.
    pub tokens: Vec<usize>,
    pub stats: GenerationStats,
}

/// Runs the autoregressive loop: ingests the prompt, then samples until a stop token or the position bound.
///
/// Every position feeds the current token through the model. While prompt tokens remain the next
/// token is taken from the prompt, afterwards it is sampled from the logits and reported through
/// `on_token`. The state's latest token always holds the token to be fed at the next position.
pub fn generate_tokens<T, S>(
    model: &T,
    state: &mut InferenceState,
    request: &GenerationRequest,
    sampler: &mut S,
    mut on_token: Option<&mut dyn FnMut(usize)>,
) -> GenerationOutput
where
    T: Transformer + ?Sized,
    S: Sampler + ?Sized,
{
    let start_time = Instant::now();
    let seq_len = model.get_config().seq_len;
    let max_tokens = request.max_tokens.map_or(seq_len, |max_tokens| max_tokens.min(seq_len));

    let mut generated = Vec::new();
    let mut token = state.latest_token;
    let mut prompt_index = 0;

    for position in request.start_position..max_tokens {
        model.forward(state, token, position);

        let next_token = if prompt_index < request.prompt_tokens.len() {
            let next = request.prompt_tokens[prompt_index];
            prompt_index += 1;
            echo_token(request.echo, next);
            next
        } else {
            let next = sampler.sample(&mut state.logits);
            echo_token(request.echo, next);
            generated.push(next);
            if let Some(callback) = on_token.as_deref_mut() {
                callback(next);
            }
            if request.stop_tokens.contains(&next) {
                state.latest_token = next;
                break;
            }
            next
        };

        state.latest_token = next_token;
        token = next_token;
    }

    let stats = GenerationStats {
        prompt_tokens: prompt_index,
        generated_tokens: generated.len(),
        elapsed: start_time.elapsed(),
    };
    info!("{:.2} tokens/s ({})", stats.tokens_per_second(), stats.total_tokens());

    GenerationOutput { tokens: generated, stats }
}

fn echo_token(tokenizer: Option<&dyn Tokenizer>, token: usize) {
    if let Some(tokenizer) = tokenizer {
        eprint!("{}", replace_control_characters(&tokenizer.decode(&[token])));
    }
}

/// Prints a streamed token unless it is special.
fn stream_token(tokenizer: &dyn Tokenizer, token: usize) {
    if !tokenizer.is_special_token(token) {
        print!("{}", tokenizer.decode(&[token]));
        io::stdout().flush().ok();
    }
}

/// Drops a trailing stop token, returning whether there was one.
fn strip_stop_token(tokens: &mut Vec<usize>, stop_tokens: &HashSet<usize>) -> bool {
    match tokens.last() {
        Some(token) if stop_tokens.contains(token) => {
            tokens.pop();
            true
        }
        _ => false,
    }
}

fn print_response(tokenizer: &dyn Tokenizer, tokens: &[usize], stream: bool) {
    if stream {
        println!();
    } else {
        println!("{}", tokenizer.decode(tokens));
    }
}

/// Generates the assistant's reply to the configured system and user prompt and decodes it.
///
/// Sampled tokens are streamed to stdout while they are produced when `config.stream` is set.
pub fn generate_response<T, S>(
    model: &T,
    tokenizer: &dyn Tokenizer,
    sampler: &mut S,
    config: &InferenceConfig,
) -> Result<Response>
where
    T: Transformer + ?Sized,
    S: Sampler + ?Sized,
{
    let prompt = config.prompt.as_deref().context("Please provide a prompt")?;
    let chat_format = ChatFormat::new(tokenizer)?;

    let mut dialog = Vec::new();
    if let Some(system_prompt) = config.system_prompt.as_deref() {
        dialog.push(Message::new(Role::System, system_prompt));
    }
    dialog.push(Message::new(Role::User, prompt));

    let prompt_tokens = chat_format.encode_dialog_prompt(true, &dialog);
    let stop_tokens = chat_format.stop_tokens();

    let mut state = model.new_state();
    state.latest_token = chat_format.begin_of_text;

    let request = GenerationRequest {
        start_position: 0,
        prompt_tokens: &prompt_tokens[1..],
        stop_tokens: &stop_tokens,
        max_tokens: config.max_tokens,
        echo: config.echo.then_some(tokenizer),
    };

    let mut on_token = |token: usize| {
        if config.stream {
            stream_token(tokenizer, token);
        }
    };

    let output = generate_tokens(model, &mut state, &request, sampler, Some(&mut on_token));
    let mut tokens = output.tokens;
    let stopped = strip_stop_token(&mut tokens, &stop_tokens);

    Ok(Response { content: tokenizer.decode(&tokens), stopped, stats: output.stats })
}

/// Answers a single prompt.
pub fn run_instruct_once<T: Transformer + ?Sized>(
    model: &T,
    tokenizer: &dyn Tokenizer,
    sampler: &mut dyn Sampler,
    config: &InferenceConfig,
) -> Result<()> {
    let response = generate_response(model, tokenizer, sampler, config)?;
    if config.stream {
        println!();
    } else {
        println!("{}", response.content);
    }

    if !response.stopped {
        warn!("Ran out of context length...");
    }

    Ok(())
}

/// Chat loop keeping the conversation and its KV cache across turns until `quit`, `exit` or end of input.
pub fn run_interactive<T: Transformer + ?Sized>(
    model: &T,
    tokenizer: &dyn Tokenizer,
    sampler: &mut dyn Sampler,
    config: &InferenceConfig,
) -> Result<()> {
    let chat_format = ChatFormat::new(tokenizer)?;
    let stop_tokens = chat_format.stop_tokens();

    let mut conversation = vec![chat_format.begin_of_text];
    if let Some(system_prompt) = config.system_prompt.as_deref() {
        conversation.extend(chat_format.encode_message(&Message::new(Role::System, system_prompt)));
    }

    // index of the conversation token held in the state's latest token
    let mut pending = 0;
    let mut session: Option<InferenceState> = None;
    let mut cli_user_prompt = config.prompt.clone();
    let stdin = io::stdin();

    let mut on_token = |token: usize| {
        if config.stream {
            stream_token(tokenizer, token);
        }
    };

    loop {
        let user_text = match cli_user_prompt.take() {
            Some(prompt) => prompt,
            None => {
                print!("> ");
                io::stdout().flush()?;

                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    break;
                }
                line.trim_end_matches(['\r', '\n']).to_string()
            }
        };

        if matches!(user_text.as_str(), "quit" | "exit") {
            break;
        }

        let state = session.get_or_insert_with(|| {
            let mut state = model.new_state();
            state.latest_token = chat_format.begin_of_text;
            state
        });

        conversation.extend(chat_format.encode_message(&Message::new(Role::User, user_text)));
        conversation.extend(chat_format.encode_header(Role::Assistant));

        let output = {
            let request = GenerationRequest {
                start_position: pending,
                prompt_tokens: &conversation[pending + 1..],
                stop_tokens: &stop_tokens,
                max_tokens: config.max_tokens,
                echo: config.echo.then_some(tokenizer),
            };
            generate_tokens(model, state, &request, sampler, Some(&mut on_token))
        };

        // the stop token stays in the history but is not shown
        conversation.extend_from_slice(&output.tokens);
        pending = conversation.len() - 1;

        let mut response = output.tokens;
        let stopped = strip_stop_token(&mut response, &stop_tokens);
        print_response(tokenizer, &response, config.stream);

        if !stopped {
            warn!("Ran out of context length...");
            break;
        }
    }

    Ok(())
}
