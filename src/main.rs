use anyhow::{bail, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rs_harness::suite;
use rs_harness::{HarnessConfig, TestCore, TestOutcome};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rs-harness", about = "Run the bundled compute-script unit tests")]
struct Args {
    /// TOML file with harness settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only run tests whose name contains this string
    #[arg(long)]
    filter: Option<String>,

    /// List the bundled tests and exit
    #[arg(long)]
    list: bool,

    /// Override the validation message timeout
    #[arg(long)]
    message_timeout_ms: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    }
    .with_env_overrides()?;
    if let Some(ms) = args.message_timeout_ms {
        config.message_timeout_ms = ms;
    }

    let mut core = TestCore::new(config);
    for test in suite::all_tests() {
        core.add(test);
    }

    if args.list {
        for name in core.names() {
            println!("{name}");
        }
        return Ok(());
    }

    let filter = args.filter.unwrap_or_default();
    let selected = core.names().iter().filter(|n| n.contains(&filter)).count();
    if selected == 0 {
        bail!("no test matches `{filter}`");
    }

    println!("🧪 Compute Script Harness");
    println!("{}", "=".repeat(70));

    let pb = ProgressBar::new(selected as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let report = core.run_matching(
        |name| name.contains(&filter),
        |result| {
            pb.set_message(result.name.clone());
            pb.inc(1);
        },
    );
    pb.finish_and_clear();

    println!("\n📈 Results:");
    for result in &report.results {
        let mark = match result.outcome {
            TestOutcome::Passed => "✅",
            _ => "❌",
        };
        println!(
            "   {mark} {:<28} {} ({:.2?})",
            result.name, result.outcome, result.elapsed
        );
    }
    println!(
        "\n   Passed: {}, Failed: {}",
        report.passed(),
        report.failed()
    );

    if !report.all_passed() {
        bail!("{} of {} tests failed", report.failed(), report.results.len());
    }
    println!("\n✅ All Tests Passed!");
    Ok(())
}
