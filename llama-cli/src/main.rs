use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use llama_inference::{DotKernel, GgufFile, InferenceConfigBuilder, describe_model, run_inference};
use log::error;

/// Define the inference subcommand.
fn inference_subcommand() -> Command {
    Command::new("inference")
        .about("Llama 3 inference in Rust")
        .arg(
            Arg::new("checkpoint")
                .help("GGUF model file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], 0 is greedy [default: 0.1]")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1] [default: 0.95]")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = max tokens")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-tokens")
                .short('n')
                .long("max-tokens")
                .value_name("INT")
                .help("Number of steps to run for, < 0 = limited by context length [default: 512]")
                .allow_negative_numbers(true)
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("STRING")
                .help("Mode: instruct|chat [default: instruct with --input, chat otherwise]"),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("STRING")
                .help("Input prompt"),
        )
        .arg(
            Arg::new("system")
                .short('y')
                .long("system")
                .value_name("STRING")
                .help("System prompt"),
        )
        .arg(
            Arg::new("stream")
                .long("stream")
                .value_name("BOOL")
                .help("Print tokens as they are generated [default: true]")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new("echo")
                .long("echo")
                .help("Print every ingested and sampled token to stderr")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("kernel")
                .long("kernel")
                .value_name("STRING")
                .help("Dot product kernel: scalar|simd128|simd256 [default: simd256]"),
        )
}

/// Define the inspect subcommand.
fn inspect_subcommand() -> Command {
    Command::new("inspect")
        .about("Print the header, metadata and tensor directory of a GGUF file")
        .arg(
            Arg::new("checkpoint")
                .help("GGUF model file")
                .required(true)
                .index(1),
        )
}

/// Run the inference command with the provided arguments
fn run_inference_command(matches: &ArgMatches) -> Result<()> {
    let kernel = matches
        .get_one::<String>("kernel")
        .map(|kernel| kernel.parse::<DotKernel>())
        .transpose()?;

    let config = InferenceConfigBuilder::default()
        .checkpoint_path(matches.get_one::<String>("checkpoint"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .topp(matches.get_one::<f32>("topp").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .max_tokens(matches.get_one::<i64>("max-tokens").copied())
        .mode(matches.get_one::<String>("mode"))
        .prompt(matches.get_one::<String>("input"))
        .system_prompt(matches.get_one::<String>("system"))
        .stream(matches.get_one::<bool>("stream").copied())
        .echo(Some(matches.get_flag("echo")))
        .seed(matches.get_one::<u64>("seed").copied())
        .kernel(kernel)
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    run_inference(config).map_err(|e| anyhow::anyhow!("Inference failed: {e:#}"))?;

    Ok(())
}

/// Run the inspect command with the provided arguments
fn run_inspect_command(matches: &ArgMatches) -> Result<()> {
    let path = matches.get_one::<String>("checkpoint").context("Model file is required")?;
    let file = GgufFile::open(path)?;

    print!("{}", describe_model(&file));

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("llama")
        .about("Llama CLI: runs quantized Llama 3 models stored in GGUF files")
        .subcommand(inference_subcommand())
        .subcommand(inspect_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("inference", matches)) => run_inference_command(matches),
        Some(("inspect", matches)) => run_inspect_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
