use crate::{
    config::{self, AppConfig},
    conflict::{parse_selection, ConflictRow},
    importer::{self, ImportEvent},
    install::{FileOutcome, InstallError},
    library::{self, LibraryMod},
    logging::{self, LogLevel},
    paths::{self, FolderRole},
    session::Session,
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

struct GlobalOptions {
    format: OutputFormat,
    verbose: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Paths,
    SetGame(PathBuf),
    List,
    Import(Vec<PathBuf>),
    ImportPending,
    Conflicts {
        mod_id: String,
        folders: Vec<String>,
    },
    Install {
        mod_id: String,
        folders: Vec<String>,
        force: bool,
    },
    Uninstall(String),
    Restore,
    Status,
    Delete(String),
    Help,
    Version,
}

struct CliContext {
    base_dir: PathBuf,
    config: AppConfig,
    session: Session,
    format: OutputFormat,
}

impl CliContext {
    fn require_game(&self) -> Result<()> {
        paths::verify_game_root(&self.session.paths().game_root)
            .context("set the game folder with `voicesmith set-game <dir>`")
    }

    fn print_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, tokens) = parse_global_options(&args);
    let command = parse_command(&tokens)?;
    match command {
        CliCommand::Help => {
            print_help();
            return Ok(());
        }
        CliCommand::Version => {
            println!("voicesmith v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let base_dir = config::data_dir()?;
    if let Err(err) = logging::init(&config::log_path(&base_dir), global.verbose) {
        eprintln!("Warning: logging disabled: {err:#}");
    }
    let config = AppConfig::load_or_create_in(&base_dir)?;
    let mod_paths = config.mod_paths(&base_dir);
    mod_paths.ensure_app_dirs()?;
    let mut ctx = CliContext {
        base_dir,
        config,
        session: Session::new(mod_paths),
        format: global.format,
    };
    run_command(&mut ctx, command)
}

fn parse_global_options(args: &[String]) -> (GlobalOptions, Vec<String>) {
    let mut format = OutputFormat::Text;
    let mut verbose = false;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            if let Some(parsed) = OutputFormat::parse(value) {
                format = parsed;
            }
            continue;
        }
        if arg == "--format" {
            if let Some(value) = iter.next() {
                if let Some(parsed) = OutputFormat::parse(value) {
                    format = parsed;
                }
            }
            continue;
        }
        if arg == "-v" || arg == "--verbose" {
            verbose = true;
            continue;
        }
        tokens.push(arg.to_string());
    }

    (GlobalOptions { format, verbose }, tokens)
}

fn parse_command(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    let command = match head.as_str() {
        "help" | "--help" | "-h" => CliCommand::Help,
        "version" | "--version" | "-V" => CliCommand::Version,
        "paths" => CliCommand::Paths,
        "set-game" => CliCommand::SetGame(PathBuf::from(required(rest, "set-game <dir>")?)),
        "list" => CliCommand::List,
        "import" => {
            if rest.is_empty() {
                bail!("usage: voicesmith import <archive...>");
            }
            CliCommand::Import(rest.iter().map(PathBuf::from).collect())
        }
        "import-pending" => CliCommand::ImportPending,
        "conflicts" => CliCommand::Conflicts {
            mod_id: required(rest, "conflicts <mod> [folders...]")?,
            folders: rest.get(1..).unwrap_or(&[]).to_vec(),
        },
        "install" => {
            let force = rest.iter().any(|arg| arg == "--force" || arg == "-f");
            let positional: Vec<String> = rest
                .iter()
                .filter(|arg| *arg != "--force" && *arg != "-f")
                .cloned()
                .collect();
            CliCommand::Install {
                mod_id: required(&positional, "install <mod> [folders...] [--force]")?,
                folders: positional.get(1..).unwrap_or(&[]).to_vec(),
                force,
            }
        }
        "uninstall" => CliCommand::Uninstall(required(rest, "uninstall <mod>")?),
        "restore" => CliCommand::Restore,
        "status" => CliCommand::Status,
        "delete" => CliCommand::Delete(required(rest, "delete <mod>")?),
        other => bail!("unknown command: {other} (see `voicesmith help`)"),
    };
    Ok(command)
}

fn required(args: &[String], usage: &str) -> Result<String> {
    match args.first() {
        Some(value) if !value.trim().is_empty() => Ok(value.clone()),
        _ => bail!("usage: voicesmith {usage}"),
    }
}

fn run_command(ctx: &mut CliContext, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::Paths => show_paths(ctx),
        CliCommand::SetGame(dir) => set_game(ctx, &dir),
        CliCommand::List => list_mods(ctx),
        CliCommand::Import(paths) => import_archives(ctx, paths),
        CliCommand::ImportPending => {
            let archives = importer::pending_archives(&ctx.session.paths().pending_dir)?;
            if archives.is_empty() {
                println!("No archives waiting in {}", ctx.session.paths().pending_dir.display());
                return Ok(());
            }
            import_archives(ctx, archives)
        }
        CliCommand::Conflicts { mod_id, folders } => show_conflicts(ctx, &mod_id, &folders),
        CliCommand::Install {
            mod_id,
            folders,
            force,
        } => install_mod(ctx, &mod_id, &folders, force),
        CliCommand::Uninstall(mod_id) => uninstall_mod(ctx, &mod_id),
        CliCommand::Restore => restore_game(ctx),
        CliCommand::Status => show_status(ctx),
        CliCommand::Delete(mod_id) => delete_mod(ctx, &mod_id),
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("voicesmith v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct PathsOutput {
    data_dir: String,
    log_file: String,
    game: String,
    game_voice: String,
    pending: String,
    library: String,
    manifest: String,
    host_config: String,
    game_valid: bool,
}

fn show_paths(ctx: &CliContext) -> Result<()> {
    let paths = ctx.session.paths();
    let role = |role: FolderRole| paths.resolve(role).display().to_string();
    let output = PathsOutput {
        data_dir: ctx.base_dir.display().to_string(),
        log_file: config::log_path(&ctx.base_dir).display().to_string(),
        game: role(FolderRole::Game),
        game_voice: role(FolderRole::GameVoice),
        pending: role(FolderRole::Pending),
        library: role(FolderRole::Library),
        manifest: paths.manifest_path().display().to_string(),
        host_config: paths.host_config_path().display().to_string(),
        game_valid: paths::looks_like_game_root(&paths.game_root),
    };

    match ctx.format {
        OutputFormat::Json => ctx.print_json(&output)?,
        OutputFormat::Text => {
            println!("Data dir: {}", output.data_dir);
            println!("Log file: {}", output.log_file);
            println!("Game: {}", output.game);
            println!("Game voice: {}", output.game_voice);
            println!("Pending: {}", output.pending);
            println!("Library: {}", output.library);
            println!("Manifest: {}", output.manifest);
            println!("config.blk: {}", output.host_config);
            if !output.game_valid {
                println!("Warning: game folder not set or invalid");
            }
        }
    }
    Ok(())
}

fn set_game(ctx: &mut CliContext, dir: &Path) -> Result<()> {
    paths::verify_game_root(dir)?;
    let game_root = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    ctx.config.game_path = game_root.clone();
    ctx.config.save_in(&ctx.base_dir)?;
    log::info!("game folder set to {}", game_root.display());
    println!("Game folder set to {}", game_root.display());
    Ok(())
}

#[derive(Serialize)]
struct ModListItem<'a> {
    #[serde(flatten)]
    entry: &'a LibraryMod,
    installed: bool,
    current: bool,
}

fn list_mods(ctx: &CliContext) -> Result<()> {
    let mods = library::scan_library(&ctx.session.paths().library_dir)?;
    let installed: HashSet<String> = if ctx.require_game().is_ok() {
        ctx.session
            .load_manifest()?
            .installed_mods
            .into_keys()
            .collect()
    } else {
        HashSet::new()
    };

    let items: Vec<ModListItem<'_>> = mods
        .iter()
        .map(|entry| ModListItem {
            installed: installed.contains(&entry.id),
            current: ctx.config.current_mod.as_deref() == Some(entry.id.as_str()),
            entry,
        })
        .collect();

    match ctx.format {
        OutputFormat::Json => ctx.print_json(&items)?,
        OutputFormat::Text => {
            if items.is_empty() {
                println!("Library is empty: {}", ctx.session.paths().library_dir.display());
            }
            for item in items {
                let marker = if item.installed { "x" } else { " " };
                let folders: Vec<String> = item
                    .entry
                    .folders
                    .iter()
                    .map(|folder| format!("{}:{}", folder.path, folder.kind.label()))
                    .collect();
                println!(
                    "[{marker}] {id:<24} {size:>9} {date:<10} {title}",
                    id = item.entry.id,
                    size = item.entry.size_label,
                    date = item.entry.date.as_deref().unwrap_or("-"),
                    title = item.entry.title,
                );
                if !folders.is_empty() {
                    println!("      folders: {}", folders.join(", "));
                }
                let caps = item.entry.capabilities.labels();
                if !caps.is_empty() {
                    println!("      covers: {}", caps.join(", "));
                }
            }
        }
    }
    Ok(())
}

fn import_archives(ctx: &CliContext, archives: Vec<PathBuf>) -> Result<()> {
    let library_dir = &ctx.session.paths().library_dir;
    let collisions = importer::find_name_collisions(&archives, library_dir);
    if !collisions.is_empty() {
        bail!(
            "already in the library: {} (delete or rename before importing)",
            collisions.join(", ")
        );
    }

    let mut events = Vec::new();
    let mut failed = 0usize;
    for event in ctx.session.import(archives) {
        if let ImportEvent::Log(entry) = &event {
            if entry.level == LogLevel::Error {
                failed += 1;
            }
        }
        if ctx.format == OutputFormat::Text {
            match &event {
                ImportEvent::Progress {
                    current,
                    total,
                    label,
                } => println!("[{current}/{total}] {label}"),
                ImportEvent::Log(entry) => {
                    println!("  {}: {}", entry.level.label(), entry.message)
                }
                ImportEvent::Finished => println!("Import finished"),
            }
        }
        events.push(event);
    }

    if ctx.format == OutputFormat::Json {
        ctx.print_json(&events)?;
    }
    if failed > 0 {
        bail!("{failed} archive(s) failed to import");
    }
    Ok(())
}

fn show_conflicts(ctx: &CliContext, mod_id: &str, folders: &[String]) -> Result<()> {
    ctx.require_game()?;
    let rows = ctx
        .session
        .conflict_rows(mod_id, &parse_selection(folders));
    match ctx.format {
        OutputFormat::Json => ctx.print_json(&rows)?,
        OutputFormat::Text => print_conflict_rows(mod_id, &rows),
    }
    Ok(())
}

fn print_conflict_rows(mod_id: &str, rows: &[ConflictRow]) {
    if rows.is_empty() {
        println!("No conflicts for {mod_id}");
        return;
    }
    for row in rows {
        match &row.error {
            Some(error) => println!("Error: {error}"),
            None => println!("{}: owned by {}", row.file, row.existing_mod),
        }
    }
}

#[derive(Serialize)]
struct InstallOutput<'a> {
    mod_id: &'a str,
    installed: &'a [String],
    outcomes: &'a [FileOutcome],
    issues: Vec<String>,
    taken_over: Vec<ConflictRow>,
    removed_stale: &'a [String],
    flag_warning: Option<&'a str>,
}

fn install_mod(ctx: &mut CliContext, mod_id: &str, folders: &[String], force: bool) -> Result<()> {
    ctx.require_game()?;
    let selection = parse_selection(folders);
    if !force {
        let conflicts = ctx.session.check_conflicts(mod_id, &selection)?;
        if !conflicts.is_empty() {
            let rows: Vec<ConflictRow> = conflicts.into_iter().map(ConflictRow::from).collect();
            match ctx.format {
                OutputFormat::Json => ctx.print_json(&rows)?,
                OutputFormat::Text => print_conflict_rows(mod_id, &rows),
            }
            bail!(
                "{} file(s) belong to other mods; rerun with --force to take them over",
                rows.len()
            );
        }
    }

    let report = match ctx.session.install(mod_id, &selection) {
        Ok(report) => report,
        Err(InstallError::NoFilesInstalled {
            mod_id,
            outcomes,
            issues,
        }) => {
            for outcome in &outcomes {
                if let FileOutcome::Failed { name, error } = outcome {
                    eprintln!("  {name}: {error}");
                }
            }
            for issue in &issues {
                eprintln!("  {issue}");
            }
            bail!("no files were installed for {mod_id}");
        }
        Err(err) => return Err(err.into()),
    };

    ctx.config.current_mod = Some(mod_id.to_string());
    if let Err(err) = ctx.config.save_in(&ctx.base_dir) {
        log::warn!("remember current mod failed: {err:#}");
    }

    let output = InstallOutput {
        mod_id,
        installed: &report.installed,
        outcomes: &report.outcomes,
        issues: report.issues.iter().map(ToString::to_string).collect(),
        taken_over: report
            .takeovers
            .iter()
            .map(|takeover| ConflictRow {
                file: takeover.file.clone(),
                existing_mod: takeover.previous_owner.clone(),
                new_mod: mod_id.to_string(),
                error: None,
            })
            .collect(),
        removed_stale: &report.removed_stale,
        flag_warning: report.flag_warning.as_deref(),
    };

    match ctx.format {
        OutputFormat::Json => ctx.print_json(&output)?,
        OutputFormat::Text => {
            println!(
                "Installed {mod_id}: {} file(s), {} failed",
                report.installed.len(),
                report.failed_count()
            );
            for outcome in &report.outcomes {
                if let FileOutcome::Failed { name, error } = outcome {
                    println!("  failed {name}: {error}");
                }
            }
            for issue in &output.issues {
                println!("  note: {issue}");
            }
            for row in &output.taken_over {
                println!("  took over {} from {}", row.file, row.existing_mod);
            }
            for name in &report.removed_stale {
                println!("  removed leftover {name}");
            }
            if let Some(warning) = &report.flag_warning {
                println!("Warning: could not enable mod loading: {warning}");
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct UninstallOutput<'a> {
    mod_id: &'a str,
    was_installed: bool,
    removed: &'a [String],
    failures: &'a [FileOutcome],
}

fn uninstall_mod(ctx: &mut CliContext, mod_id: &str) -> Result<()> {
    ctx.require_game()?;
    let report = ctx.session.uninstall(mod_id)?;
    if report.was_installed && ctx.config.current_mod.as_deref() == Some(mod_id) {
        ctx.config.current_mod = None;
        if let Err(err) = ctx.config.save_in(&ctx.base_dir) {
            log::warn!("clear current mod failed: {err:#}");
        }
    }

    match ctx.format {
        OutputFormat::Json => ctx.print_json(&UninstallOutput {
            mod_id,
            was_installed: report.was_installed,
            removed: &report.removed,
            failures: &report.failures,
        })?,
        OutputFormat::Text => {
            if !report.was_installed {
                println!("{mod_id} is not installed");
            } else {
                println!("Uninstalled {mod_id}: {} file(s) removed", report.removed.len());
                for failure in &report.failures {
                    if let FileOutcome::Failed { name, error } = failure {
                        println!("  failed {name}: {error}");
                    }
                }
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct RestoreOutput {
    removed: Vec<String>,
    failures: Vec<String>,
    flag_warning: Option<String>,
}

fn restore_game(ctx: &mut CliContext) -> Result<()> {
    ctx.require_game()?;
    let report = ctx.session.restore()?;
    ctx.config.current_mod = None;
    if let Err(err) = ctx.config.save_in(&ctx.base_dir) {
        log::warn!("clear current mod failed: {err:#}");
    }

    let output = RestoreOutput {
        removed: report
            .removed
            .iter()
            .map(|path| path.display().to_string())
            .collect(),
        failures: report.failures,
        flag_warning: report.flag_warning,
    };
    match ctx.format {
        OutputFormat::Json => ctx.print_json(&output)?,
        OutputFormat::Text => {
            println!("Restored game voices: {} entr(ies) removed", output.removed.len());
            for failure in &output.failures {
                println!("  failed: {failure}");
            }
            if let Some(warning) = &output.flag_warning {
                println!("Warning: could not disable mod loading: {warning}");
            }
        }
    }
    Ok(())
}

fn show_status(ctx: &CliContext) -> Result<()> {
    ctx.require_game()?;
    let status = ctx.session.status()?;
    match ctx.format {
        OutputFormat::Json => ctx.print_json(&status)?,
        OutputFormat::Text => {
            println!("Game: {}", status.game_root.display());
            println!("Game voice: {}", status.target_dir.display());
            let flag = match status.flag_enabled {
                Some(true) => "on",
                Some(false) => "off",
                None => "unset",
            };
            println!("Mod loading: {flag}");
            if status.manifest.installed_mods.is_empty() {
                println!("No mods installed");
            }
            for (mod_id, record) in &status.manifest.installed_mods {
                println!(
                    "  {mod_id:<24} {:>4} file(s)  {}",
                    record.files.len(),
                    record.install_time
                );
            }
            for violation in &status.violations {
                println!("Warning: {violation}");
            }
        }
    }
    Ok(())
}

fn delete_mod(ctx: &mut CliContext, mod_id: &str) -> Result<()> {
    library::delete_mod(&ctx.session.paths().library_dir, mod_id)?;
    if ctx.config.current_mod.as_deref() == Some(mod_id) {
        ctx.config.current_mod = None;
        ctx.config.save_in(&ctx.base_dir)?;
    }
    println!("Deleted {mod_id} from the library");
    Ok(())
}

fn print_help() {
    println!("voicesmith v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  voicesmith paths                          Show resolved folders");
    println!("  voicesmith set-game <dir>                 Set the {} folder", paths::GAME_NAME);
    println!("  voicesmith list                           List library mods");
    println!("  voicesmith import <archive...>            Extract archives into the library");
    println!("  voicesmith import-pending                 Import everything in the pending folder");
    println!("  voicesmith conflicts <mod> [folders...]   Show files owned by other mods");
    println!("  voicesmith install <mod> [folders...]     Install a mod (root folder by default)");
    println!("  voicesmith uninstall <mod>                Remove an installed mod");
    println!("  voicesmith restore                        Remove every installed voice file");
    println!("  voicesmith status                         Show installed mods and mod loading");
    println!("  voicesmith delete <mod>                   Delete a mod from the library");
    println!();
    println!("Options:");
    println!("  --format <json|text>                      Output format");
    println!("  --force                                   Install over conflicts");
    println!("  -v, --verbose                             Debug logging on stderr");
    println!("  -h, --help                                Show help");
    println!("  -V, --version                             Show version");
}
