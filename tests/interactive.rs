use std::error::Error;
use std::io::{self, Write};
use std::time::Duration;

use linkbypass_rs::{BypassManager, BypassResult, EngineConfig, VERSION};
use tokio::runtime::Runtime;

fn prompt(label: &str) -> io::Result<String> {
    print!("{} ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn parse_bool(input: &str, default: bool) -> bool {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" => true,
        "n" | "no" | "false" => false,
        _ => default,
    }
}

fn parse_secs(input: &str, default: u64) -> Duration {
    Duration::from_secs(input.trim().parse().ok().filter(|value| *value > 0).unwrap_or(default))
}

#[test]
#[ignore = "Requires network access and manual input"]
fn interactive_resolution() -> Result<(), Box<dyn Error>> {
    println!("linkbypass-rs {} interactive smoke test", VERSION);
    println!("Provide inputs when prompted. Press Enter to accept defaults.\n");

    let url_input = prompt("Short link [https://bit.ly/3example]:")?;
    let target_url = if url_input.is_empty() {
        "https://bit.ly/3example".to_string()
    } else {
        url_input
    };

    let timeout_answer = prompt("Strategy timeout in seconds (blank keeps each strategy's own):")?;
    let single_answer = prompt("Run a single strategy by name (blank for the full cascade):")?;
    let twice_answer = prompt("Resolve twice to exercise the cache? (Y/n):")?;

    let mut config = EngineConfig::from_env()?;
    if !timeout_answer.trim().is_empty() {
        config.strategy_timeout = Some(parse_secs(&timeout_answer, 30));
    }

    let manager = BypassManager::builder().with_config(config).build()?;
    let runtime = Runtime::new()?;

    println!("\nStrategies:");
    for info in manager.strategies() {
        println!("  {}. {} ({}s)", info.position, info.name, info.timeout.as_secs());
    }

    if !single_answer.is_empty() {
        let outcome = runtime.block_on(manager.attempt_strategy(&target_url, &single_answer))?;
        println!("\n{single_answer} -> {outcome:?}");
        return Ok(());
    }

    runtime.block_on(manager.start())?;
    println!("\nResolving {}...", target_url);
    let result = runtime.block_on(manager.resolve(&target_url, "interactive"));
    println!("{}", result.summary());
    if let BypassResult::Unresolved { diagnostics } = &result {
        println!("{diagnostics}");
    }

    if parse_bool(&twice_answer, true) && result.is_resolved() {
        let again = runtime.block_on(manager.resolve(&target_url, "interactive"));
        println!("Second call: {}", again.summary());
    }

    let stats = manager.stats();
    if let Some(metrics) = stats.metrics {
        println!(
            "\nResolutions: {}, cache hits: {}, success rate: {:.0}%",
            metrics.global.resolutions,
            metrics.global.cache_hits,
            metrics.global.success_rate() * 100.0
        );
        for strategy in metrics.strategies {
            println!(
                "  {} -> attempts {}, successes {}, p95 {:?}",
                strategy.strategy, strategy.attempts, strategy.successes, strategy.p95_latency
            );
        }
    }

    runtime.block_on(manager.shutdown());
    println!("Interactive test complete. Re-run with different inputs as needed.");
    Ok(())
}
