//! Source and target listing commands.

use console::style;

use lotacquire::config::Config;

use crate::cli::helpers::truncate;

/// List configured sources.
pub fn cmd_sources(config: &Config) -> anyhow::Result<()> {
    if config.sources.is_empty() {
        println!(
            "{} No sources configured. Add a [sources.<key>] section to lotacquire.toml.",
            style("!").yellow()
        );
        return Ok(());
    }

    println!("\n{}", style("Auction Sources").bold());
    println!("{}", "-".repeat(72));
    println!("{:<15} {:<25} {:<8} {:<8} Base URL", "Key", "Name", "Budget", "Targets");
    println!("{}", "-".repeat(72));
    for (key, source) in &config.sources {
        println!(
            "{:<15} {:<25} {:<8} {:<8} {}",
            truncate(key, 14),
            truncate(source.display_name(key), 24),
            format!("{:?}", source.budget).to_lowercase(),
            source.targets.len(),
            source.base_url
        );
    }
    Ok(())
}

/// List the targets of one source.
pub fn cmd_targets(config: &Config, source_id: &str) -> anyhow::Result<()> {
    let source = config.source(source_id)?;

    println!(
        "\n{} {}",
        style("Targets for").bold(),
        style(source.display_name(source_id)).cyan()
    );
    println!("{}", "-".repeat(80));
    println!("{:<28} {:<12} {:<10} {:<10} Search URL", "Slug", "Model", "Trim", "Gen");
    println!("{}", "-".repeat(80));
    for target in &source.targets {
        println!(
            "{:<28} {:<12} {:<10} {:<10} {}",
            truncate(&target.slug, 27),
            truncate(&target.model, 11),
            target.trim.as_deref().unwrap_or("-"),
            target.generation.as_deref().unwrap_or("-"),
            target.search_url
        );
    }
    if source.targets.is_empty() {
        println!("{} No targets configured", style("!").yellow());
    }
    Ok(())
}
