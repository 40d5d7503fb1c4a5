//! Implementation of `drover check`.

use crate::cli::CheckArgs;
use crate::config::Config;
use crate::error::Result;

/// Load and validate the config, then print what it resolves to.
pub fn cmd_check(args: CheckArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;

    println!("Config OK: {}", args.config.display());
    println!();
    println!("Paths:");
    println!("  socket     {}", config.socket_path().display());
    println!("  output     {}", config.output_path().display());
    println!("  plugins    {}", config.plugins_root().display());
    println!("  templates  {}", config.templates_root().display());
    println!("  logs       {}", config.logs_dir().display());
    println!();
    println!("Settings:");
    println!("  cooldown_seconds    {}", config.cooldown_seconds);
    println!("  poll_tick_s         {}", config.poll_tick_s);
    println!("  shutdown_timeout_s  {}", config.shutdown_timeout_s);
    println!("  drain_timeout_s     {}", config.drain_timeout_s);
    println!("  agent_log_level     {}", config.agent_log_level.as_str());
    println!();

    if config.agents.is_empty() {
        println!("Agents: none configured");
        return Ok(());
    }
    println!("Agents:");
    for (label, agent) in &config.agents {
        println!(
            "  {:<20} {:<8} {}",
            label,
            if agent.enabled { "enabled" } else { "disabled" },
            agent.executable
        );
    }
    Ok(())
}
