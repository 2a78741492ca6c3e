use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;

use visual_truth_loop::annotations::AnnotationStore;
use visual_truth_loop::config::{load_config, DEFAULT_CONFIG_FILE};
use visual_truth_loop::files::abs_path;
use visual_truth_loop::logging;
use visual_truth_loop::run_log::RunLog;
use visual_truth_loop::{AgentConfig, AgentLoop, AgentParts, RunOutcome};

const LABEL_PREVIEW_CHARS: usize = 60;

#[derive(Parser, Debug)]
#[command(
    name = "visual-truth-loop",
    version,
    about = "Vision-driven desktop agent with a ground-truth overlay loop"
)]
struct Cli {
    /// TOML config path (missing file means defaults)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Run the agent loop until the oracle says done
    Run(RunArgs),
    /// Validate and execute one action JSON, then dump the resulting frame
    Act(ActArgs),
    /// Print the annotation store
    Labels(LabelsArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// What the agent should accomplish
    #[arg(long)]
    goal: String,
    /// Override policy.max_cycles
    #[arg(long)]
    max_cycles: Option<u32>,
    /// Override the output root
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ActArgs {
    /// Action JSON, or `-` to read it from stdin
    action: String,
    /// Also write the composed frame here
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct LabelsArgs {
    /// Print raw JSON instead of a table
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init();

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Run(args) => command_run(load_config(&cli.config)?, args),
        Commands::Act(args) => command_act(load_config(&cli.config)?, args),
        Commands::Labels(args) => command_labels(load_config(&cli.config)?, args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "run",
            "description": "Run the capture/decide/act loop for a goal.",
            "requires": "native"
        }),
        json!({
            "name": "act",
            "description": "Execute one action JSON through the executor and dump the composed frame.",
            "requires": "native"
        }),
        json!({
            "name": "labels",
            "description": "Print stored UI annotations in insertion order.",
            "requires": null
        }),
        json!({
            "name": "commands",
            "description": "Print this list.",
            "requires": null
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn command_run(mut cfg: AgentConfig, args: RunArgs) -> Result<()> {
    if args.goal.trim().is_empty() {
        bail!("--goal must not be empty");
    }
    if let Some(max_cycles) = args.max_cycles {
        cfg.policy.max_cycles = max_cycles;
    }
    if let Some(out_dir) = args.out_dir {
        cfg.output.root = Some(out_dir);
    }
    cfg.validate()?;

    let root = abs_path(&cfg.output.resolved_root());
    let run_log = RunLog::create(&root)?;
    let run_dir = run_log.dir().to_path_buf();
    info!(run_dir = %run_dir.display(), "run directory ready");

    let mut agent = AgentLoop::new(native::parts(&cfg)?, &cfg).with_run_log(run_log);
    let outcome = agent.run(args.goal.trim());

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "outcome": outcome,
            "run_dir": run_dir,
            "annotations": cfg.output.annotations_path(),
        }))?
    );
    match outcome {
        RunOutcome::Terminated { .. } => Ok(()),
        RunOutcome::Failed { reason, .. } => bail!("run failed: {reason}"),
    }
}

fn command_act(cfg: AgentConfig, args: ActArgs) -> Result<()> {
    let raw = if args.action == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read action from stdin")?;
        buf
    } else {
        args.action
    };

    let root = abs_path(&cfg.output.resolved_root());
    let run_log = RunLog::create(&root)?;
    let run_dir = run_log.dir().to_path_buf();
    let mut agent = AgentLoop::new(native::parts(&cfg)?, &cfg).with_run_log(run_log);
    let report = agent.act(&raw)?;

    if let Some(out) = &args.out {
        visual_truth_loop::files::write_atomic(out, &report.truth.png)?;
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "action": report.decision.action,
            "justification": report.decision.justification,
            "outcome": report.outcome,
            "frame": run_dir.join("step001_screen.png"),
            "out": args.out.as_deref().map(abs_path),
        }))?
    );
    Ok(())
}

fn command_labels(cfg: AgentConfig, args: LabelsArgs) -> Result<()> {
    let path = cfg.output.annotations_path();
    let store = AnnotationStore::load(&path)?;
    if args.json {
        let raw = if path.exists() {
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
        } else {
            "{}".to_string()
        };
        println!("{}", raw.trim_end());
        return Ok(());
    }
    if store.is_empty() {
        println!("no labels in {}", path.display());
        return Ok(());
    }
    for (label, ann) in store.iter() {
        let desc: String = ann.description.chars().take(LABEL_PREVIEW_CHARS).collect();
        println!(
            "{label:<24} ({:>4.0},{:>4.0}) {:>4.0}x{:<4.0} conf={:.2}  {desc}",
            ann.x, ann.y, ann.width, ann.height, ann.confidence
        );
    }
    Ok(())
}

#[cfg(feature = "native")]
mod native {
    use anyhow::Result;

    use visual_truth_loop::annotations::AnnotationStore;
    use visual_truth_loop::capture::{DesktopSource, XcapDesktop};
    use visual_truth_loop::coords::CoordinateSpace;
    use visual_truth_loop::input::EnigoSink;
    use visual_truth_loop::oracle::build_oracle;
    use visual_truth_loop::overlay::{platform_presenter, OverlayStyle, OverlaySurface};
    use visual_truth_loop::{AgentConfig, AgentParts};

    pub fn parts(cfg: &AgentConfig) -> Result<AgentParts> {
        let desktop = XcapDesktop::new();
        let (width, height) = desktop.screen_size()?;
        let coords = CoordinateSpace::new(width, height);
        let style = OverlayStyle::from_config(&cfg.overlay)?;
        let overlay = OverlaySurface::spawn(coords, style, platform_presenter)?;
        Ok(AgentParts {
            desktop: Box::new(desktop),
            sink: Box::new(EnigoSink::new(coords)?),
            oracle: build_oracle(&cfg.oracle)?,
            overlay,
            store: AnnotationStore::load(&cfg.output.annotations_path())?,
        })
    }
}

#[cfg(not(feature = "native"))]
mod native {
    use anyhow::{bail, Result};

    use visual_truth_loop::{AgentConfig, AgentParts};

    pub fn parts(_cfg: &AgentConfig) -> Result<AgentParts> {
        bail!("this build has no desktop backend; rebuild with `--features native`")
    }
}
