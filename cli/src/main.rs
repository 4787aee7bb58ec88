//! nmtprep CLI - NMT text preparation tool
//!
//! Runs the forward and reverse chains of a model directory over files or
//! standard input, and serves JSON request batches through a passthrough engine.

use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use nmtprep::request::read_engine_args;
use nmtprep::{
    clean, unescape, EchoTranslator, LanguageProfile, ModelContext, PipelineOptions, RequestItem,
    TranslationService,
};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Text normalization, tokenization and subword chains for NMT serving
#[derive(Parser)]
#[command(
    name = "nmtprep",
    author = "iyulab",
    version,
    about = "Prepare text for neural machine translation",
    long_about = "nmtprep - NMT preprocessing and postprocessing.\n\n\
                  Runs a model's forward chain (unescape, clean, segment, tokenize, bpe)\n\
                  or reverse chain (debpe, detokenize) one line at a time.\n\n\
                  Usage:\n  \
                  nmtprep preprocess <model_dir> [input]    Engine input from raw text\n  \
                  nmtprep postprocess <model_dir> [input]   Response text from engine output\n  \
                  nmtprep translate <model_dir> <requests>  Serve a JSON request batch"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

/// Model selection shared by the model-backed commands.
#[derive(clap::Args)]
struct ModelArgs {
    /// Model directory (scripts/, bpe-codes.txt)
    model_dir: PathBuf,

    /// Model name; its leading language code selects the profile (default: directory name)
    #[arg(short, long)]
    model: Option<String>,

    /// JSON file with pipeline options
    #[arg(long)]
    options: Option<PathBuf>,

    /// Directory of the tokenizer/detokenizer programs
    #[arg(long)]
    scripts_dir: Option<PathBuf>,

    /// External program timeout in milliseconds (0 disables)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the forward chain over each input line
    #[command(visible_alias = "pre")]
    Preprocess {
        #[command(flatten)]
        model: ModelArgs,

        /// Input file (default: stdin)
        input: Option<PathBuf>,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the reverse chain over each input line
    #[command(visible_alias = "post")]
    Postprocess {
        #[command(flatten)]
        model: ModelArgs,

        /// Input file (default: stdin)
        input: Option<PathBuf>,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decode HTML character references, line by line
    Unescape {
        /// Input file (default: stdin)
        input: Option<PathBuf>,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// NFKC-normalize and strip control characters, line by line
    Clean {
        /// Input file (default: stdin)
        input: Option<PathBuf>,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Serve a JSON array of request items through a passthrough engine
    Translate {
        #[command(flatten)]
        model: ModelArgs,

        /// JSON file holding an array of request items
        requests: PathBuf,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output compact JSON (no indentation)
        #[arg(long)]
        compact: bool,
    },

    /// Show the chains a model directory produces
    Info {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Show version information
    Version,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli.command) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Preprocess {
            model,
            input,
            output,
        } => {
            let profile = load_profile(&model)?;
            let lines = read_lines(input.as_deref())?;
            let processed = lines
                .iter()
                .map(|line| profile.preprocess(line))
                .collect::<nmtprep::Result<Vec<_>>>()?;
            write_output(output.as_ref(), &processed.join("\n"))?;
        }

        Commands::Postprocess {
            model,
            input,
            output,
        } => {
            let profile = load_profile(&model)?;
            let lines = read_lines(input.as_deref())?;
            let processed = lines
                .iter()
                .map(|line| profile.postprocess(line))
                .collect::<nmtprep::Result<Vec<_>>>()?;
            write_output(output.as_ref(), &processed.join("\n"))?;
        }

        Commands::Unescape { input, output } => {
            let lines = read_lines(input.as_deref())?;
            let processed: Vec<String> = lines.iter().map(|line| unescape(line)).collect();
            write_output(output.as_ref(), &processed.join("\n"))?;
        }

        Commands::Clean { input, output } => {
            let lines = read_lines(input.as_deref())?;
            let processed: Vec<String> = lines.iter().map(|line| clean(line)).collect();
            write_output(output.as_ref(), &processed.join("\n"))?;
        }

        Commands::Translate {
            model,
            requests,
            output,
            compact,
        } => {
            let data = fs::read_to_string(&requests)?;
            let value: serde_json::Value = serde_json::from_str(&data)?;
            let batch: Vec<RequestItem> = match value {
                serde_json::Value::Array(items) => {
                    items.into_iter().map(RequestItem::from_json).collect()
                }
                single => vec![RequestItem::from_json(single)],
            };

            let pb = create_spinner("Loading model profile...");
            let mut service = TranslationService::new(EchoTranslator, pipeline_options(&model)?);
            let loaded = service.initialize(&model_context(&model));
            pb.finish_and_clear();
            loaded?;

            let responses = service.handle(&batch)?;
            let json = if compact {
                serde_json::to_string(&responses)?
            } else {
                serde_json::to_string_pretty(&responses)?
            };
            write_output(output.as_ref(), &json)?;

            if responses.len() != batch.len() {
                eprintln!(
                    "{} {} of {} request items had no text",
                    "!".yellow().bold(),
                    batch.len() - responses.len(),
                    batch.len()
                );
            }
        }

        Commands::Info { model } => {
            let options = pipeline_options(&model)?;
            let context = model_context(&model);
            let profile = load_profile(&model)?;

            println!("{}", "Model Profile".cyan().bold());
            println!("{}", "─".repeat(40));
            println!("{}: {}", "Model".bold(), context.model_name);
            println!("{}: {}", "Language".bold(), profile.language());
            println!(
                "{}: {}",
                "Forward".bold(),
                profile.forward().stage_names().join(" -> ")
            );
            println!(
                "{}: {}",
                "Reverse".bold(),
                profile.reverse().stage_names().join(" -> ")
            );
            println!(
                "{}: {}",
                "Subword".bold(),
                if profile.has_subword() { "yes" } else { "no" }
            );

            let args_path = context.model_dir.join(&options.engine_args);
            if args_path.is_file() {
                let args = read_engine_args(&args_path)?;
                println!("{}: {}", "Engine args".bold(), args.join(" "));
            }
        }

        Commands::Version => {
            print_version();
        }
    }

    Ok(())
}

fn pipeline_options(args: &ModelArgs) -> Result<PipelineOptions, Box<dyn std::error::Error>> {
    let mut options = match &args.options {
        Some(path) => PipelineOptions::from_json_file(path)?,
        None => PipelineOptions::default(),
    };
    if let Some(dir) = &args.scripts_dir {
        options = options.with_scripts_dir(dir);
    }
    match args.timeout_ms {
        Some(0) => options = options.without_timeout(),
        Some(ms) => options = options.with_timeout(Duration::from_millis(ms)),
        None => {}
    }
    Ok(options)
}

fn model_context(args: &ModelArgs) -> ModelContext {
    let name = args.model.clone().unwrap_or_else(|| {
        args.model_dir
            .canonicalize()
            .unwrap_or_else(|_| args.model_dir.clone())
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    });
    ModelContext::new(name, &args.model_dir)
}

fn load_profile(args: &ModelArgs) -> Result<LanguageProfile, Box<dyn std::error::Error>> {
    let options = pipeline_options(args)?;
    let context = model_context(args);

    let pb = create_spinner("Loading model profile...");
    let profile = LanguageProfile::build(context.language(), &context.model_dir, &options);
    pb.finish_and_clear();
    log::info!("loaded profile for model '{}'", context.model_name);
    Ok(profile?)
}

fn read_lines(path: Option<&Path>) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let content = match path {
        Some(p) => fs::read_to_string(p)?,
        None => {
            let mut buf = String::new();
            io::stdin().lock().read_to_string(&mut buf)?;
            buf
        }
    };
    Ok(content.lines().map(str::to_string).collect())
}

fn print_version() {
    println!("{} {}", "nmtprep".green().bold(), env!("CARGO_PKG_VERSION"));
    println!("Text preparation for neural machine translation serving");
    println!();
    println!("Forward: unescape, clean, segment, tokenizer, bpe");
    println!("Reverse: debpe, detokenizer");
}

fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn write_output(path: Option<&PathBuf>, content: &str) -> Result<(), Box<dyn std::error::Error>> {
    match path {
        Some(p) => {
            fs::write(p, content)?;
            println!("{} Wrote {}", "✓".green().bold(), p.display());
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            writeln!(handle, "{}", content)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_model_name_defaults_to_dir() {
        let cli = Cli::try_parse_from(["nmtprep", "info", "/models/ko-en"]).unwrap();
        let Commands::Info { model } = cli.command else {
            panic!("expected info command");
        };
        assert_eq!(model_context(&model).model_name, "ko-en");
    }

    #[test]
    fn test_timeout_flag() {
        let cli = Cli::try_parse_from([
            "nmtprep",
            "pre",
            "/models/de",
            "--timeout-ms",
            "0",
            "--model",
            "de",
        ])
        .unwrap();
        let Commands::Preprocess { model, .. } = cli.command else {
            panic!("expected preprocess command");
        };
        assert_eq!(pipeline_options(&model).unwrap().timeout(), None);
    }
}
