use std::path::Path;

use tabbridge_core::Config;

/// Print configuration status and validation results.
pub fn run(config_path: &Path) -> anyhow::Result<()> {
    println!("tabbridge status");
    println!("================");

    if config_path.exists() {
        println!("Config file: {}", config_path.display());
    } else {
        println!(
            "Config file: {} (not found, using defaults)",
            config_path.display()
        );
    }
    let config = Config::load_or_default(config_path)?;

    println!();
    println!("Bridge");
    println!("  listen        {}:{}", config.bridge.host, config.bridge.port);
    println!("  api keys      {}", config.bridge.api_keys.len());
    println!(
        "  origins       {}",
        if config.bridge.allowed_origins.is_empty() {
            "(none, all connections will be rejected)".to_string()
        } else {
            config.bridge.allowed_origins.join(", ")
        }
    );
    println!(
        "  rate limit    {} requests / {}ms",
        config.bridge.rate_limit_max_requests, config.bridge.rate_limit_window_ms
    );
    println!("  idle timeout  {}ms", config.bridge.session_timeout_ms);

    println!();
    println!("Upstream");
    if config.upstream.command.is_empty() {
        println!("  command       (not configured)");
    } else {
        println!(
            "  command       {} {}",
            config.upstream.command,
            config.upstream.args.join(" ")
        );
    }

    println!();
    match config.bridge.validate() {
        Ok(()) => println!("Config OK, ready to run `tabbridge bridge`"),
        Err(e) => println!("Config invalid: {}", e),
    }
    Ok(())
}
