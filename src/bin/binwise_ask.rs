//! binwise-ask - ask the local disposal assistant a question

use anyhow::{anyhow, Result};
use clap::Parser;

use binwise::chat::{ChatMessage, ChatRole, GenerateOptions, COMMON_QUESTIONS};
use binwise::AppConfig;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Question to ask, e.g. "Where do old batteries go?"
    question: Vec<String>,
    /// Ollama server URL.
    #[arg(long, env = "BINWISE_OLLAMA_URL")]
    url: Option<String>,
    /// Model name.
    #[arg(long, env = "BINWISE_OLLAMA_MODEL")]
    model: Option<String>,
    /// Print the starter questions and exit.
    #[arg(long)]
    examples: bool,
    /// Check the server connection and list installed models.
    #[arg(long)]
    ping: bool,
    /// Print the model output without cleanup.
    #[arg(long)]
    raw: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.examples {
        for question in COMMON_QUESTIONS {
            println!("{}", question);
        }
        return Ok(());
    }

    let mut cfg = AppConfig::load()?;
    if let Some(url) = args.url {
        cfg.chat.base_url = url;
    }
    if let Some(model) = args.model {
        cfg.chat.model = model;
    }
    let client = cfg.chat_client();

    if args.ping {
        if !client.test_connection() {
            return Err(anyhow!("ollama is not reachable at {}", client.base_url()));
        }
        println!("connected to {}", client.base_url());
        for model in client.list_models()? {
            let marker = if model == client.model() { "*" } else { " " };
            println!(" {} {}", marker, model);
        }
        return Ok(());
    }

    let question = args.question.join(" ");
    if question.trim().is_empty() {
        return Err(anyhow!("no question given; try --examples for ideas"));
    }

    let answer = if args.raw {
        let options = GenerateOptions {
            temperature: cfg.chat.temperature,
            max_tokens: cfg.chat.max_tokens,
        };
        client.chat_completion(&[ChatMessage::new(ChatRole::User, question.as_str())], options)?
    } else {
        client.disposal_answer(&question)?
    };
    println!("{}", answer);
    Ok(())
}
