//! The command-line surface. A single flat argument struct (no
//! subcommands — this tool only ever does one thing: build, then
//! optionally run, a set of targets), parsed with `clap`'s derive API.

use crate::config::{LayeredConfig, ROOT_SECTION};
use crate::engine::Engine;
use crate::error::BuildError;
use crate::kinds::{FileKindRegistry, JobKindRegistry};
use crate::layout;
use crate::tree::{Tree, TreeKind, TreeRegistry};
use clap::Parser;
use itertools::Itertools;
use log::debug;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "jhm", version, about = "An inference-driven build engine")]
pub struct Cli {
    /// Target platform architecture; defaults to the host's.
    #[arg(short, long)]
    pub arch: Option<String>,

    /// Target operating system; defaults to the host's.
    #[arg(long)]
    pub os: Option<String>,

    /// Named configuration (selects which `<config>[_<os>][_<arch>].jhm`
    /// file to load from each config layer).
    #[arg(short, long, default_value = "debug")]
    pub config: String,

    /// Increases log verbosity; repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Additional include-tree roots, searched after SRC and before OUT,
    /// in the order given (project config's own `+incl-tree` entries are
    /// searched first, then these).
    #[arg(short = 'I', long = "inc-tree", value_name = "DIR")]
    pub inc_tree: Vec<PathBuf>,

    /// Rebuild every target from scratch, ignoring all caches.
    #[arg(short, long)]
    pub force: bool,

    /// Source tree root (default: `<root>/src`).
    #[arg(long, value_name = "DIR")]
    pub src_dir: Option<PathBuf>,

    /// Output tree root (default: `<root>/out/<config>[-os][-arch]`).
    #[arg(long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Project root (default: nearest ancestor containing a `.jhm/`
    /// directory).
    #[arg(long, value_name = "DIR")]
    pub root_dir: Option<PathBuf>,

    /// Project config directory (default: `<root>/.jhm`).
    #[arg(long, value_name = "DIR")]
    pub project_conf_dir: Option<PathBuf>,

    /// User config directory (default: `~/.jhm`).
    #[arg(long, value_name = "DIR")]
    pub user_conf_dir: Option<PathBuf>,

    /// System config directory (default: `/etc/jhm`).
    #[arg(long, value_name = "DIR")]
    pub sys_conf_dir: Option<PathBuf>,

    /// Worker thread count (default: the `num_cores` config key, else
    /// available parallelism).
    #[arg(long)]
    pub num_cores: Option<usize>,

    /// Don't fall back to the project config's `+targets` section when no
    /// targets are given on the command line.
    #[arg(long)]
    pub no_auto_targets: bool,

    /// Run each target after it's built, if it's executable.
    #[arg(short = 'x', long = "exec")]
    pub exec: bool,

    /// Print backtraces for internal errors.
    #[arg(long)]
    pub jhm_debug: bool,

    /// Echo every external command (build and otherwise) before running
    /// it.
    #[arg(long)]
    pub print_commands: bool,

    /// Echo only the commands that actually run a producer job.
    #[arg(long)]
    pub print_build_commands: bool,

    /// Targets to build (paths, relative to the current directory unless
    /// absolute).
    pub targets: Vec<String>,
}

/// Parses `std::env::args`, wires up an [`Engine`] from the resolved
/// layout/config, builds the (possibly auto-discovered) targets, and
/// runs the `-x` exec phase if asked. No concrete file-kinds or
/// job-kinds ship with this crate; embedders call [`run_with_kinds`]
/// instead of this function to register their own before the engine
/// starts resolving targets.
pub fn run() -> eyre::Result<()> {
    run_with_kinds(|_, _| {})
}

/// Same as [`run`], but lets the caller populate the file-kind and
/// job-kind registries before any target is resolved (the extension
/// point a real embedding uses in place of dynamic plugin loading,
/// which this crate has no equivalent for — see `DESIGN.md`).
pub fn run_with_kinds(register: impl FnOnce(&mut FileKindRegistry, &mut JobKindRegistry)) -> eyre::Result<()> {
    let cli = Cli::parse();
    crate::logging::init(cli.verbose);

    let cwd = std::env::current_dir()?;
    let root = layout::resolve_root(&cwd, cli.root_dir.as_deref())?;
    debug!("project root: {}", root.display());

    let os = cli.os.clone().unwrap_or_else(|| layout::host_os().to_string());
    let arch = cli.arch.clone().unwrap_or_else(|| layout::host_arch().to_string());

    let project_conf_dir = resolve_dir(&root, cli.project_conf_dir.as_deref(), || root.join(".jhm"));
    let user_conf_dir = resolve_dir(&root, cli.user_conf_dir.as_deref(), || {
        dirs::home_dir().unwrap_or_else(|| root.clone()).join(".jhm")
    });
    let sys_conf_dir = resolve_dir(&root, cli.sys_conf_dir.as_deref(), || PathBuf::from("/etc/jhm"));

    let config = LayeredConfig::load(&project_conf_dir, &user_conf_dir, &sys_conf_dir, &cli.config, &os, &arch)?;

    let src_root = resolve_dir(&root, cli.src_dir.as_deref(), || {
        root.join(config.get("src_dir", ROOT_SECTION).unwrap_or_else(|| "src".to_string()))
    });
    let out_base = config.get("out_dir", ROOT_SECTION).unwrap_or_else(|| "out".to_string());
    let out_sub = layout::out_sub_dir(&cli.config, &os, &arch, layout::host_os(), layout::host_arch());
    let out_root = resolve_dir(&root, cli.out_dir.as_deref(), || root.join(out_base).join(out_sub));

    // Project config's `+incl-tree` entries first, then `-I` flags.
    let inc_roots: Vec<PathBuf> = config
        .project
        .yield_section("incl-tree")
        .keys()
        .map(|k| layout::project_abs(&root, &PathBuf::from(k)))
        .chain(cli.inc_tree.iter().map(|p| layout::project_abs(&cwd, p)))
        .unique()
        .collect();

    let trees = TreeRegistry::new(
        Tree::new(TreeKind::Src, src_root),
        inc_roots.into_iter().map(|r| Tree::new(TreeKind::Inc, r)).collect(),
        Tree::new(TreeKind::Out, out_root),
    );

    let num_workers = cli
        .num_cores
        .or_else(|| config.get_sys("num_cores", ROOT_SECTION).and_then(|v| v.parse().ok()))
        .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

    let mut file_kinds = FileKindRegistry::new();
    let mut job_kinds = JobKindRegistry::new();
    register(&mut file_kinds, &mut job_kinds);
    if file_kinds.is_empty() || job_kinds.is_empty() {
        return Err(BuildError::Configuration(
            "no file kinds were registered; an embedder must call run_with_kinds".to_string(),
        )
        .into());
    }

    let jhm_debug = cli.jhm_debug || *crate::env::JHM_DEBUG;
    let engine = Engine::new(trees, config, file_kinds, job_kinds, cli.force, jhm_debug);

    let target_paths: Vec<String> = if cli.targets.is_empty() && !cli.no_auto_targets {
        engine.config.project.yield_section("targets").keys().cloned().collect()
    } else {
        cli.targets.clone()
    };
    if target_paths.is_empty() {
        return Err(BuildError::Configuration(
            "no targets were given and none are configured in '+targets'".to_string(),
        )
        .into());
    }
    for t in &target_paths {
        engine.add_target_by_path(t, &cwd)?;
    }

    engine.build(num_workers)?;

    if cli.exec {
        engine.exec_targets()?;
    }

    Ok(())
}

fn resolve_dir(root: &std::path::Path, override_path: Option<&std::path::Path>, default: impl FnOnce() -> PathBuf) -> PathBuf {
    match override_path {
        Some(p) => layout::project_abs(root, p),
        None => default(),
    }
}
