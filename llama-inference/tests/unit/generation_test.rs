use super::*;
use crate::configuration::ModelConfig;
use crate::sampler::ArgmaxSampler;
use std::cell::RefCell;
use std::collections::HashMap;

/// Always predicts `token + 1`, recording every (token, position) it is fed.
struct CountingModel {
    config: ModelConfig,
    calls: RefCell<Vec<(usize, usize)>>,
}

impl CountingModel {
    fn new(seq_len: usize) -> Self {
        let config = ModelConfig {
            dim: 4,
            hidden_dim: 4,
            n_layers: 1,
            n_heads: 1,
            n_kv_heads: 1,
            head_dim: 4,
            seq_len,
            vocab_size: 32,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            rope_scaling: None,
            shared_classifier: true,
        };
        Self { config, calls: RefCell::new(Vec::new()) }
    }

    fn calls(&self) -> Vec<(usize, usize)> {
        self.calls.borrow().clone()
    }
}

impl Transformer for CountingModel {
    fn forward<'s>(&self, state: &'s mut InferenceState, token: usize, pos: usize) -> &'s [f32] {
        self.calls.borrow_mut().push((token, pos));
        state.logits.fill(0.0);
        state.logits[(token + 1) % self.config.vocab_size] = 1.0;
        &state.logits
    }

    fn get_config(&self) -> &ModelConfig {
        &self.config
    }
}

fn request<'r>(
    start_position: usize,
    prompt_tokens: &'r [usize],
    stop_tokens: &'r HashSet<usize>,
    max_tokens: Option<usize>,
) -> GenerationRequest<'r> {
    GenerationRequest { start_position, prompt_tokens, stop_tokens, max_tokens, echo: None }
}

#[test]
fn test_prompt_tokens_are_forced() {
    let model = CountingModel::new(8);
    let mut state = model.new_state();
    state.latest_token = 5;
    let stop_tokens = HashSet::new();
    let mut sampler_calls = 0;
    let mut sampler = |logits: &mut [f32]| -> usize {
        sampler_calls += 1;
        ArgmaxSampler.sample(logits)
    };

    let output = generate_tokens(&model, &mut state, &request(0, &[7, 9], &stop_tokens, Some(6)), &mut sampler, None);

    assert_eq!(model.calls(), vec![(5, 0), (7, 1), (9, 2), (10, 3), (11, 4), (12, 5)]);
    assert_eq!(output.tokens, vec![10, 11, 12, 13]);
    assert_eq!(sampler_calls, 4);
    assert_eq!(output.stats.prompt_tokens, 2);
    assert_eq!(output.stats.generated_tokens, 4);
    assert_eq!(output.stats.total_tokens(), 6);
    assert_eq!(state.latest_token, 13);
}

#[test]
fn test_stop_token_ends_generation_and_is_returned() {
    let model = CountingModel::new(16);
    let mut state = model.new_state();
    state.latest_token = 1;
    let stop_tokens = HashSet::from([4]);

    let output = generate_tokens(&model, &mut state, &request(0, &[2], &stop_tokens, None), &mut ArgmaxSampler, None);

    assert_eq!(output.tokens, vec![3, 4]);
    assert_eq!(model.calls().len(), 3);
    assert_eq!(state.latest_token, 4);
}

#[test]
fn test_stop_tokens_in_the_prompt_do_not_stop() {
    let model = CountingModel::new(16);
    let mut state = model.new_state();
    let stop_tokens = HashSet::from([2]);

    let request = request(0, &[2, 2], &stop_tokens, Some(4));
    let output = generate_tokens(&model, &mut state, &request, &mut ArgmaxSampler, None);

    assert_eq!(output.tokens, vec![3, 4]);
}

#[test]
fn test_max_tokens_is_clamped_to_context_length() {
    for (max_tokens, expected) in [(None, 8), (Some(100), 8), (Some(3), 3), (Some(0), 0)] {
        let model = CountingModel::new(8);
        let mut state = model.new_state();
        let stop_tokens = HashSet::new();

        let request = request(0, &[], &stop_tokens, max_tokens);
        let output = generate_tokens(&model, &mut state, &request, &mut ArgmaxSampler, None);

        assert_eq!(output.tokens.len(), expected, "max_tokens: {max_tokens:?}");
        assert_eq!(model.calls().len(), expected);
    }
}

#[test]
fn test_generation_resumes_at_start_position() {
    let model = CountingModel::new(8);
    let mut state = model.new_state();
    state.latest_token = 20;
    let stop_tokens = HashSet::new();

    let output = generate_tokens(&model, &mut state, &request(5, &[], &stop_tokens, None), &mut ArgmaxSampler, None);

    assert_eq!(model.calls(), vec![(20, 5), (21, 6), (22, 7)]);
    assert_eq!(output.tokens, vec![21, 22, 23]);
}

#[test]
fn test_callback_sees_generated_tokens_only() {
    let model = CountingModel::new(8);
    let mut state = model.new_state();
    let stop_tokens = HashSet::from([6]);
    let mut seen = Vec::new();
    let mut on_token = |token: usize| seen.push(token);

    let output = generate_tokens(
        &model,
        &mut state,
        &request(0, &[1, 2, 3], &stop_tokens, None),
        &mut ArgmaxSampler,
        Some(&mut on_token),
    );

    assert_eq!(output.tokens, vec![4, 5, 6]);
    assert_eq!(seen, vec![4, 5, 6]);
}

#[test]
fn test_boxed_samplers_drive_generation() {
    let model = CountingModel::new(4);
    let mut state = model.new_state();
    let stop_tokens = HashSet::new();
    let mut sampler = crate::sampler::select_sampler(0.0, 0.9, 1);

    let output = generate_tokens(&model, &mut state, &request(0, &[], &stop_tokens, None), sampler.as_mut(), None);

    assert_eq!(output.tokens, vec![1, 2, 3, 4]);
}

#[test]
fn test_prompt_filling_max_tokens_never_samples() {
    let model = CountingModel::new(16);
    let mut state = model.new_state();
    let stop_tokens = HashSet::new();
    let mut sampler_calls = 0;
    let mut sampler = |logits: &mut [f32]| -> usize {
        sampler_calls += 1;
        ArgmaxSampler.sample(logits)
    };
    let prompt = [3, 1, 4, 1, 5];

    let output = generate_tokens(&model, &mut state, &request(0, &prompt, &stop_tokens, Some(5)), &mut sampler, None);

    assert!(output.tokens.is_empty());
    assert_eq!(sampler_calls, 0);
    assert_eq!(output.stats.prompt_tokens, 5);
    assert_eq!(state.latest_token, 5);
}

#[test]
fn test_first_sampled_stop_token_is_the_only_output() {
    let model = CountingModel::new(16);
    let mut state = model.new_state();
    let stop_tokens = HashSet::from([7]);
    let mut sampler_calls = 0;
    let mut sampler = |_: &mut [f32]| -> usize {
        sampler_calls += 1;
        7
    };

    let output = generate_tokens(&model, &mut state, &request(0, &[2], &stop_tokens, None), &mut sampler, None);

    assert_eq!(output.tokens, vec![7]);
    assert_eq!(sampler_calls, 1);
    assert_eq!(model.calls().len(), 2);
}

/// Bytes map to their low nibble and print as `a` to `p`, chat tokens sit above them.
struct NibbleTokenizer {
    special_tokens: HashMap<String, usize>,
}

const END_OF_TURN: usize = 23;

impl NibbleTokenizer {
    fn new() -> Self {
        let special_tokens = HashMap::from([
            ("<|begin_of_text|>".to_string(), 20),
            ("<|start_header_id|>".to_string(), 21),
            ("<|end_header_id|>".to_string(), 22),
            ("<|eot_id|>".to_string(), END_OF_TURN),
            ("<|end_of_text|>".to_string(), 24),
        ]);
        Self { special_tokens }
    }
}

impl Tokenizer for NibbleTokenizer {
    fn encode(&self, text: &str) -> Vec<usize> {
        text.bytes().map(|b| (b % 16) as usize).collect()
    }

    fn decode(&self, tokens: &[usize]) -> String {
        tokens.iter().filter(|&&t| t < 16).map(|&t| (b'a' + t as u8) as char).collect()
    }

    fn special_tokens(&self) -> &HashMap<String, usize> {
        &self.special_tokens
    }

    fn is_special_token(&self, token: usize) -> bool {
        token >= 16
    }
}

fn instruct_config(max_tokens: i64) -> Result<InferenceConfig> {
    InferenceConfig::builder()
        .checkpoint_path(Some(&"model.gguf".to_string()))
        .prompt(Some(&"hi".to_string()))
        .max_tokens(Some(max_tokens))
        .stream(Some(false))
        .build()
        .map_err(anyhow::Error::msg)
}

#[test]
fn test_response_is_decoded_without_stop_token() -> Result<()> {
    let model = CountingModel::new(64);
    let tokenizer = NibbleTokenizer::new();

    // the prompt ends with "\n" (10), so the reply counts up from 11 to the end of turn
    let response = generate_response(&model, &tokenizer, &mut ArgmaxSampler, &instruct_config(-1)?)?;

    assert!(response.stopped);
    assert_eq!(response.content, "lmnop");
    assert_eq!(response.stats.generated_tokens, END_OF_TURN - 10);
    assert_eq!(model.calls()[0], (20, 0));
    Ok(())
}

#[test]
fn test_response_cut_by_max_tokens() -> Result<()> {
    let model = CountingModel::new(64);
    let tokenizer = NibbleTokenizer::new();
    let prompt_len = ChatFormat::new(&tokenizer)?.encode_dialog_prompt(true, &[Message::new(Role::User, "hi")]).len();

    let max_tokens = prompt_len as i64 + 3;
    let response = generate_response(&model, &tokenizer, &mut ArgmaxSampler, &instruct_config(max_tokens)?)?;

    assert!(!response.stopped);
    assert_eq!(response.content, "lmno");
    assert_eq!(response.stats.prompt_tokens, prompt_len - 1);
    Ok(())
}

#[test]
fn test_response_requires_a_prompt() -> Result<()> {
    let model = CountingModel::new(8);
    let config = InferenceConfig::builder()
        .checkpoint_path(Some(&"model.gguf".to_string()))
        .build()
        .map_err(anyhow::Error::msg)?;

    let err = generate_response(&model, &NibbleTokenizer::new(), &mut ArgmaxSampler, &config).expect_err("no prompt");
    assert!(err.to_string().contains("Please provide a prompt"));
    Ok(())
}

#[test]
fn test_stats_throughput() {
    let stats = GenerationStats { prompt_tokens: 6, generated_tokens: 4, elapsed: Duration::from_millis(500) };

    assert_eq!(stats.total_tokens(), 10);
    assert_eq!(stats.tokens_per_second(), 20.0);

    let instant = GenerationStats { elapsed: Duration::ZERO, ..stats };
    assert_eq!(instant.tokens_per_second(), 0.0);
}
