//! Project initialization for trellis
//!
//! `trellis init` creates the .trellis workspace: database and config

use crate::db::Database;
use colored::Colorize;
use std::fs;
use std::path::Path;

/// Default config written on init; every key shows its default
const CONFIG_TEMPLATE: &str = r#"# Trellis configuration

[progress]
# A node is at_risk below this progress ratio late in its period
at_risk_behind = 0.5
# "Late" means less than this fraction of the period remaining
at_risk_remaining = 0.25

[streak]
# Completions required across the vision on a streak recovery day
recovery_min_actions = 3

[zombies]
# Days without recalculation before a goal is flagged
stale_days = 14
# Cap on flagged goals per listing
page_size = 20
"#;

/// Create the .trellis workspace in the current directory
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let trellis_dir = Path::new(".trellis");

    if !trellis_dir.exists() {
        fs::create_dir_all(trellis_dir)?;
        println!("{} .trellis/", "Created".green().bold());
    } else {
        println!("{} .trellis/ already exists", "Found".yellow());
    }

    let config_path = trellis_dir.join("config.toml");
    if !config_path.exists() {
        fs::write(&config_path, CONFIG_TEMPLATE)?;
        println!("{} .trellis/config.toml", "Created".green().bold());
    } else {
        println!("{} .trellis/config.toml (left untouched)", "Found".yellow());
    }

    // Opening the database bootstraps the schema
    let db_path = trellis_dir.join("trellis.db");
    let existed = db_path.exists();
    Database::open_at(&db_path)?;
    if existed {
        println!("{} .trellis/trellis.db (schema up to date)", "Found".yellow());
    } else {
        println!("{} .trellis/trellis.db", "Created".green().bold());
    }

    println!();
    println!("{}", "Trellis is ready.".bold());
    println!("  Start with: {}", "trellis vision add \"<your vision>\"".cyan());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_template_parses() {
        let config: crate::config::Config = toml::from_str(CONFIG_TEMPLATE).unwrap();
        // The template must spell out the shipped defaults
        let defaults = crate::config::Config::default();
        assert_eq!(config.progress.at_risk_behind, defaults.progress.at_risk_behind);
        assert_eq!(config.streak.recovery_min_actions, defaults.streak.recovery_min_actions);
        assert_eq!(config.zombies.stale_days, defaults.zombies.stale_days);
    }
}
