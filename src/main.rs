use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use rai::agent_file;
use rai::config::{self, Settings};
use rai::llm::copilot_auth;
use rai::llm::debug::DebugRecorder;
use rai::llm::resolve;
use rai::session::{SessionOptions, SessionRunner};
use rai::sink::{OutputSink, RecordKind};
use rai::skills;
use rai::tools::ToolExecutor;

#[derive(Parser)]
#[command(name = "rai")]
#[command(version, about = "Terminal LLM agent", long_about = None)]
struct Cli {
    /// Prompt text (joined by spaces)
    prompt: Vec<String>,

    /// Agent file providing a system prompt and settings
    #[arg(long, value_name = "PATH")]
    agent: Option<PathBuf>,

    /// Read the prompt from a file (UTF-8, trailing newlines stripped)
    #[arg(long, value_name = "PATH", conflicts_with = "prompt")]
    prompt_file: Option<PathBuf>,

    /// Only errors and the final answer reach the console
    #[arg(long)]
    silent: bool,

    /// Write a session log; `--log DEBUG` also captures HTTP traffic
    #[arg(long, value_name = "LEVEL", num_args = 0..=1, default_missing_value = "on")]
    log: Option<String>,

    /// Override the provider setting
    #[arg(long, value_name = "NAME")]
    provider: Option<String>,

    /// Override the model setting
    #[arg(long, value_name = "ID")]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Persist one settings entry into .rai/config
    Config { key: String, value: String },
    /// Skill management
    Skills {
        #[command(subcommand)]
        command: SkillsCommand,
    },
    /// Authenticate with GitHub Copilot via the device-code flow
    CopilotLogin {
        /// GitHub Enterprise domain (defaults to github.com)
        domain: Option<String>,
    },
}

#[derive(Subcommand)]
enum SkillsCommand {
    /// List discovered skills
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut cli = Cli::parse();

    let base_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("[ERR] cannot determine working directory: {err}");
            return ExitCode::from(1);
        }
    };

    match cli.command.take() {
        Some(Commands::Config { key, value }) => {
            match config::store(&base_dir, &key, &value) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("[ERR] {err}");
                    ExitCode::from(1)
                }
            }
        }
        Some(Commands::Skills {
            command: SkillsCommand::List,
        }) => {
            for skill in skills::discover(&base_dir) {
                println!("{}\t{}", skill.name, skill.description);
            }
            ExitCode::SUCCESS
        }
        Some(Commands::CopilotLogin { domain }) => {
            let ctx = cancel_on_ctrl_c();
            match copilot_auth::login(ctx, domain.as_deref().unwrap_or("")).await {
                Ok((token, domain)) => {
                    if let Err(err) = copilot_auth::save_token(&base_dir, &token) {
                        eprintln!("[ERR] {err}");
                        return ExitCode::from(1);
                    }
                    if domain.is_empty() {
                        println!("Logged in to github.com");
                    } else {
                        println!("Logged in to {domain}");
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("[ERR] {err}");
                    ExitCode::from(1)
                }
            }
        }
        None => run_prompt(cli, base_dir).await,
    }
}

async fn run_prompt(cli: Cli, base_dir: PathBuf) -> ExitCode {
    let prompt = match read_prompt(&cli) {
        Ok(Some(prompt)) => prompt,
        Ok(None) => {
            eprintln!("usage: rai [OPTIONS] <prompt>");
            return ExitCode::from(2);
        }
        Err(err) => {
            eprintln!("[ERR] {err}");
            return ExitCode::from(1);
        }
    };

    // Agent file: settings layer + system prompt
    let agent = match &cli.agent {
        Some(path) => match agent_file::load(path) {
            Ok(agent) => Some(agent),
            Err(err) => {
                eprintln!("[ERR] {err}");
                return ExitCode::from(1);
            }
        },
        None => None,
    };

    let file_layer = match config::load_file(&base_dir) {
        Ok(layer) => layer,
        Err(err) => {
            eprintln!("[ERR] {err}");
            return ExitCode::from(1);
        }
    };

    let mut cli_layer = Settings::new();
    if let Some(provider) = &cli.provider {
        cli_layer.insert("provider".to_string(), provider.clone());
    }
    if let Some(model) = &cli.model {
        cli_layer.insert("model".to_string(), model.clone());
    }

    let settings = config::merge(
        Settings::new(),
        config::env_settings(),
        file_layer,
        agent.as_ref().map(|a| a.settings.clone()).unwrap_or_default(),
        cli_layer,
    );

    // Output sink, optionally logged
    let log_enabled = cli.log.is_some();
    let debug_http = cli.log.as_deref() == Some("DEBUG");
    let sink = if log_enabled {
        match OutputSink::with_log(cli.silent, &base_dir) {
            Ok(sink) => Arc::new(sink),
            Err(err) => {
                eprintln!("[ERR] cannot open session log: {err}");
                return ExitCode::from(1);
            }
        }
    } else {
        Arc::new(OutputSink::new(cli.silent))
    };

    if log_enabled {
        let args: Vec<String> = std::env::args().skip(1).collect();
        sink.write_header(&args, agent.as_ref().map(|a| a.raw.as_str()), &prompt);
    }

    // The HTTP recorder is only installed when a writable log exists
    let debug = (debug_http && sink.log_path().is_some())
        .then(|| Arc::new(DebugRecorder::new(sink.clone())));

    let provider = match resolve(&settings, &base_dir, debug) {
        Ok(provider) => provider,
        Err(err) => {
            sink.emit(RecordKind::Err, &err.to_string());
            sink.close();
            return ExitCode::from(1);
        }
    };

    let discovered = skills::discover(&base_dir);
    let executor = ToolExecutor::new(base_dir.clone(), discovered.clone());

    let options = SessionOptions {
        system_prompt: agent
            .as_ref()
            .map(|a| a.system_prompt.clone())
            .filter(|p| !p.is_empty()),
        max_tokens: settings.get("max-tokens").and_then(|v| v.parse().ok()),
        temperature: settings.get("temperature").and_then(|v| v.parse().ok()),
        silent: cli.silent,
    };

    let runner = SessionRunner::new(provider, executor, sink.clone(), discovered, options);
    let ctx = cancel_on_ctrl_c();

    let code = match runner.run(ctx, &prompt).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::from(1),
    };
    sink.close();
    code
}

fn read_prompt(cli: &Cli) -> Result<Option<String>, String> {
    if let Some(path) = &cli.prompt_file {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("prompt file {}: {e}", path.display()))?;
        let text = text.trim_end_matches(['\n', '\r']).to_string();
        if text.is_empty() {
            return Err(format!("prompt file {} is empty", path.display()));
        }
        return Ok(Some(text));
    }

    let prompt = cli.prompt.join(" ");
    if prompt.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(prompt))
    }
}

/// A token cancelled by Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let ctx = CancellationToken::new();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    ctx
}
