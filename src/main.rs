use chrono::Local;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::{ColoredString, Colorize};
use trellis::config::Config;
use trellis::db::{parse_date, Database, KpiDraft, KpiLevel};
use trellis::recalc::Recalculator;
use trellis::tree::KpiTreeNode;
use trellis::{init, serve, stale, streak, tree};

#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author, version, about = "Progress engine for vision-driven goal tracking")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the .trellis workspace in the current directory
    Init,

    /// Manage visions (the root goals owning KPI trees)
    Vision {
        #[command(subcommand)]
        action: VisionAction,
    },

    /// Add a KPI to a vision
    Add {
        /// Granularity: quarterly, monthly, weekly, or daily
        level: KpiLevel,

        /// KPI title
        title: String,

        /// Owning vision id
        #[arg(short, long)]
        vision: i32,

        /// Parent KPI id (required below the quarterly level)
        #[arg(short, long)]
        parent: Option<i32>,

        /// Relative contribution to the parent's rollup
        #[arg(short, long)]
        weight: Option<f64>,

        /// Numeric target for value-tracked KPIs
        #[arg(long)]
        target: Option<f64>,

        /// Target date for daily KPIs (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,

        /// Period start (YYYY-MM-DD), feeds the at-risk check
        #[arg(long)]
        period_start: Option<String>,

        /// Period end (YYYY-MM-DD), feeds the at-risk check
        #[arg(long)]
        period_end: Option<String>,

        /// Longer description
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Log a completion for a KPI and roll it up the tree
    Log {
        /// KPI id
        kpi: i32,

        /// Calendar date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<String>,

        /// Numeric value for value-tracked KPIs
        #[arg(long)]
        value: Option<f64>,

        /// Record the day as missed instead of completed
        #[arg(long)]
        missed: bool,
    },

    /// Show a vision's KPI tree with cached progress
    Tree {
        /// Vision id
        vision: i32,
    },

    /// Show why a KPI's percentage is what it is
    Formula {
        /// KPI id
        kpi: i32,
    },

    /// Pin a KPI's percentage, or clear the pin with --clear
    Override {
        /// KPI id
        kpi: i32,

        /// Percentage to pin (0-100)
        percentage: Option<f64>,

        /// Why the automatic number is wrong
        #[arg(short, long)]
        reason: Option<String>,

        /// Release the override and return to automatic calculation
        #[arg(long)]
        clear: bool,
    },

    /// Move a KPI under a new parent
    Move {
        /// KPI id
        kpi: i32,

        /// New parent KPI id
        #[arg(short, long, conflicts_with = "root")]
        parent: Option<i32>,

        /// Move to the root level instead
        #[arg(long)]
        root: bool,
    },

    /// Change a KPI's rollup weight
    Weight {
        /// KPI id
        kpi: i32,

        /// New weight (positive)
        weight: f64,
    },

    /// Soft-delete a KPI (its former parent is recalculated)
    Rm {
        /// KPI id
        kpi: i32,
    },

    /// Show current and longest streaks for a KPI
    Streak {
        /// KPI id
        kpi: i32,
    },

    /// Bridge a one-day streak gap (once per ISO week)
    Recover {
        /// KPI id
        kpi: i32,
    },

    /// List goals with no recent activity
    Zombies {
        /// Vision id
        vision: i32,

        /// Staleness threshold in days (defaults to config)
        #[arg(long)]
        days: Option<i64>,
    },

    /// Recalculate a KPI and its ancestor chain by hand
    Recalc {
        /// KPI id
        kpi: i32,
    },

    /// Start the local JSON API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3210")]
        port: u16,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate for
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
enum VisionAction {
    /// Create a vision
    Add {
        /// Vision title
        title: String,

        /// Longer description
        #[arg(short, long)]
        description: Option<String>,
    },
    /// List visions
    List,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli.command) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Init => init::run(),
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "trellis", &mut std::io::stdout());
            Ok(())
        }
        Command::Serve { port } => {
            serve::start_server(port)?;
            Ok(())
        }
        Command::Vision { action } => match action {
            VisionAction::Add { title, description } => {
                let db = Database::open()?;
                let id = db.create_vision(&title, description.as_deref())?;
                println!("{} vision {} {}", "Created".green().bold(), id, title.bold());
                Ok(())
            }
            VisionAction::List => {
                let db = Database::open()?;
                let visions = db.list_visions()?;
                if visions.is_empty() {
                    println!("No visions yet. Start with: trellis vision add \"<title>\"");
                }
                for vision in visions {
                    println!("{:>4}  {}", vision.id, vision.title.bold());
                    if let Some(desc) = vision.description {
                        println!("      {}", desc.dimmed());
                    }
                }
                Ok(())
            }
        },
        Command::Add {
            level,
            title,
            vision,
            parent,
            weight,
            target,
            date,
            period_start,
            period_end,
            description,
        } => {
            for raw in [&date, &period_start, &period_end].into_iter().flatten() {
                if parse_date(raw).is_none() {
                    return Err(format!("invalid date '{}' (expected YYYY-MM-DD)", raw).into());
                }
            }
            let db = Database::open()?;
            let id = db.create_kpi(&KpiDraft {
                vision_id: vision,
                parent_kpi_id: parent,
                level,
                title: title.clone(),
                description,
                weight,
                target_value: target,
                target_date: date,
                period_start,
                period_end,
            })?;
            println!(
                "{} {} KPI {} {}",
                "Created".green().bold(),
                level,
                id,
                title.bold()
            );
            Ok(())
        }
        Command::Log { kpi, date, value, missed } => {
            let day = match date {
                Some(raw) => parse_date(&raw)
                    .ok_or_else(|| format!("invalid date '{}' (expected YYYY-MM-DD)", raw))?,
                None => Local::now().date_naive(),
            };
            let db = Database::open()?;
            let config = Config::load();
            let recalc = Recalculator::with_policy(&db, config.at_risk_policy());
            let outcome = recalc.log_completion(kpi, day, !missed, value)?;

            let verb = if missed { "Missed".yellow().bold() } else { "Logged".green().bold() };
            println!(
                "{} KPI {} on {} → {}%",
                verb,
                kpi,
                day,
                outcome.cache.progress_percentage.round() as i32
            );
            let chain: Vec<String> = outcome.ancestors_updated.iter().map(|id| id.to_string()).collect();
            println!("  recalculated: {}", chain.join(" → ").dimmed());
            Ok(())
        }
        Command::Tree { vision } => {
            let db = Database::open()?;
            let records = db.vision_records(vision)?;
            let forest = tree::build_forest(&records);
            let title = db.get_vision(vision)?.title;

            println!("{}", title.bold());
            for (i, node) in forest.iter().enumerate() {
                print_tree_node(node, "", i + 1 == forest.len());
            }
            println!();
            println!("  {} KPIs", tree::count_tree_nodes(&forest));
            match tree::latest_calculation_time(&forest) {
                Some(at) => println!("  data as of {}", at.dimmed()),
                None => println!("  {}", "never calculated".dimmed()),
            }
            Ok(())
        }
        Command::Formula { kpi } => {
            let db = Database::open()?;
            let formula = serve::stored_formula(&db, kpi)?;

            println!("KPI {} → {}%  ({})", kpi, formula.display_percentage(), formula.method);
            println!("  {}", formula.expression.bold());
            if let Some(reason) = &formula.override_reason {
                println!("  reason: {}", reason);
            }
            for component in &formula.components {
                println!(
                    "  {:>4}  {:<30} {:>6}% × {:<4} → {:>5.1}",
                    component.kpi_id,
                    component.title,
                    component.progress.round() as i32,
                    component.weight,
                    component.contribution
                );
            }
            Ok(())
        }
        Command::Override { kpi, percentage, reason, clear } => {
            let db = Database::open()?;
            let config = Config::load();
            let recalc = Recalculator::with_policy(&db, config.at_risk_policy());
            if clear {
                let updated = recalc.clear_manual_override(kpi)?;
                println!("{} override on KPI {}", "Cleared".green().bold(), kpi);
                print_updated(&updated);
            } else {
                let pct = percentage.ok_or("provide a percentage, or --clear to release")?;
                let reason = reason.ok_or("an override needs --reason explaining it")?;
                let updated = recalc.set_manual_override(kpi, pct, &reason)?;
                println!("{} KPI {} at {}%", "Pinned".green().bold(), kpi, pct);
                print_updated(&updated);
            }
            Ok(())
        }
        Command::Move { kpi, parent, root } => {
            if parent.is_none() && !root {
                return Err("provide --parent <id>, or --root to move to the top level".into());
            }
            let db = Database::open()?;
            let config = Config::load();
            let recalc = Recalculator::with_policy(&db, config.at_risk_policy());
            let updated = recalc.reparent(kpi, parent)?;
            println!("{} KPI {}", "Moved".green().bold(), kpi);
            print_updated(&updated);
            Ok(())
        }
        Command::Weight { kpi, weight } => {
            let db = Database::open()?;
            let config = Config::load();
            let recalc = Recalculator::with_policy(&db, config.at_risk_policy());
            let updated = recalc.set_weight(kpi, weight)?;
            println!("{} KPI {} weight to {}", "Set".green().bold(), kpi, weight);
            print_updated(&updated);
            Ok(())
        }
        Command::Rm { kpi } => {
            let db = Database::open()?;
            let config = Config::load();
            let recalc = Recalculator::with_policy(&db, config.at_risk_policy());
            let updated = recalc.deactivate(kpi)?;
            println!("{} KPI {}", "Deleted".green().bold(), kpi);
            print_updated(&updated);
            Ok(())
        }
        Command::Streak { kpi } => {
            let db = Database::open()?;
            let summary = streak::streak_summary(&db, kpi, Local::now().date_naive())?;
            print_streak(kpi, &summary);
            Ok(())
        }
        Command::Recover { kpi } => {
            let db = Database::open()?;
            let config = Config::load();
            let summary = streak::attempt_recovery(
                &db,
                kpi,
                Local::now().date_naive(),
                config.streak.recovery_min_actions,
            )?;
            println!("{} streak for KPI {}", "Recovered".green().bold(), kpi);
            print_streak(kpi, &summary);
            Ok(())
        }
        Command::Zombies { vision, days } => {
            let db = Database::open()?;
            let config = Config::load();
            let records = db.vision_records(vision)?;
            let zombies = stale::detect_zombies(
                &records,
                days.unwrap_or(config.zombies.stale_days),
                config.zombies.page_size,
                Local::now(),
            );
            if zombies.is_empty() {
                println!("{}", "No zombie goals. Everything has recent activity.".green());
            }
            for zombie in zombies {
                println!(
                    "{:>4}  {:<30} {:>4} days stale  [{}]",
                    zombie.kpi_id,
                    zombie.title,
                    zombie.days_stale.to_string().red().bold(),
                    zombie.level
                );
            }
            Ok(())
        }
        Command::Recalc { kpi } => {
            let db = Database::open()?;
            let config = Config::load();
            let recalc = Recalculator::with_policy(&db, config.at_risk_policy());
            let updated = recalc.recalculate(kpi)?;
            println!("{} KPI {}", "Recalculated".green().bold(), kpi);
            print_updated(&updated);
            Ok(())
        }
    }
}

fn print_updated(updated: &[i32]) {
    if !updated.is_empty() {
        let chain: Vec<String> = updated.iter().map(|id| id.to_string()).collect();
        println!("  recalculated: {}", chain.join(" → ").dimmed());
    }
}

fn print_streak(kpi: i32, summary: &streak::StreakSummary) {
    println!("KPI {} streaks", kpi);
    println!("  current: {}", summary.current_streak.to_string().bold());
    println!("  longest: {}", summary.longest_streak);
    match &summary.last_activity_date {
        Some(day) => println!("  last activity: {}", day),
        None => println!("  last activity: {}", "never".dimmed()),
    }
    let recovery = match summary.recovery {
        streak::RecoveryState::Available => "available".green(),
        streak::RecoveryState::Used => "used this week".yellow(),
    };
    println!("  recovery: {}", recovery);
}

fn paint_status(status: &str, text: String) -> ColoredString {
    match status {
        "completed" => text.green(),
        "at_risk" => text.red().bold(),
        "in_progress" => text.yellow(),
        _ => text.dimmed(),
    }
}

fn print_tree_node(node: &KpiTreeNode, prefix: &str, last: bool) {
    let connector = if last { "└── " } else { "├── " };
    let label = format!(
        "{} [{}] {}% {}",
        node.title, node.level, node.progress, node.status
    );
    println!("{}{}{}  {}", prefix, connector, paint_status(&node.status, label), format!("#{}", node.id).dimmed());

    let child_prefix = format!("{}{}", prefix, if last { "    " } else { "│   " });
    for (i, child) in node.children.iter().enumerate() {
        print_tree_node(child, &child_prefix, i + 1 == node.children.len());
    }
}
