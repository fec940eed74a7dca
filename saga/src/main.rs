//! Serialized fiction runner.
//!
//! Writes one story to a directory store, resuming where the last run
//! stopped:
//!
//! ```bash
//! cargo run -p saga -- --story ember --premise "A courier carries a forbidden letter." --target 30
//! ```

mod args;

use saga_core::generation::{ClaudeGenerator, RetryPolicy, RetryingGenerator};
use saga_core::memory::InstallmentRecord;
use saga_core::persist::JsonFileStore;
use saga_core::planning::StoryArc;
use saga_core::runner::{RunError, Runner, RunnerEvents};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Prints one line per accepted installment and finished arc.
struct Progress;

impl RunnerEvents for Progress {
    fn on_installment(&self, record: &InstallmentRecord) {
        let review = if record.needs_review { "  [REVIEW]" } else { "" };
        println!(
            "[{:>4}] {} ({} words, score {}){review}",
            record.number,
            record.title,
            record.word_count(),
            record.score
        );
    }

    fn on_arc(&self, arc: &StoryArc) {
        println!("[ARC {}] {} (installments {}-{})", arc.arc_number, arc.theme, arc.start, arc.end);
    }

    fn on_error(&self, error: &RunError) {
        eprintln!("[ERROR] {error}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("saga=info,saga_core=info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("ANTHROPIC_API_KEY").is_err() {
        eprintln!("Error: ANTHROPIC_API_KEY environment variable not set.");
        eprintln!("Please set it in .env file or with: export ANTHROPIC_API_KEY=your_key_here");
        std::process::exit(1);
    }

    let cli = match args::parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };
    let store_root = cli.store.clone().unwrap_or_else(|| "stories".into());
    let model = cli.model.clone();
    let config = cli.into_config().await?;

    let mut client = ClaudeGenerator::from_env()?;
    if let Some(model) = model {
        client = client.with_model(model);
    }
    let cancel = CancellationToken::new();
    let generator =
        RetryingGenerator::new(Arc::new(client), RetryPolicy::default()).with_cancellation(cancel.clone());

    let mut runner = Runner::new(config, Arc::new(generator), Arc::new(JsonFileStore::new(store_root)))
        .with_events(Arc::new(Progress));

    let handle = runner.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping");
            handle.stop();
            cancel.cancel();
        }
    });

    let result = runner.run().await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_help() {
    println!("saga - write a long serialized story, one installment at a time");
    println!();
    println!("USAGE:");
    println!("  saga [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help              Show this help message");
    println!("  --config <FILE>         JSON run configuration");
    println!("  --premise <TEXT>        Story premise");
    println!("  --premise-file <FILE>   Read the premise from a file");
    println!("  --world-file <FILE>     Foundational world document");
    println!("  --story <ID>            Story id, used as the storage key (default: story)");
    println!("  --store <DIR>           Story directory root (default: stories)");
    println!("  --target <N>            Story length in installments (default: 100)");
    println!("  --arc-size <N>          Installments per arc (default: 10)");
    println!("  --session-limit <N>     Stop after writing N installments this run");
    println!("  --seed <N>              Seed for twist placement");
    println!("  --model <MODEL>         Claude model");
    println!();
    println!("Logging follows RUST_LOG (default: saga=info,saga_core=info).");
    println!();
    println!("EXAMPLES:");
    println!("  saga --story ember --premise \"A courier carries a forbidden letter.\" --target 30");
    println!("  saga --config run.json --session-limit 5   # continue an existing story");
}
