use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use log::{info, warn};
use wikimirror_core::config::{MirrorConfig, load_config};
use wikimirror_core::crawl::{FetchOptions, HttpFetcher};
use wikimirror_core::ledger::UploadLedger;
use wikimirror_core::mediawiki::{MediaWikiPlatform, MediaWikiPlatformConfig};
use wikimirror_core::mirror::{MirrorOptions, MirrorReport, mirror_site};
use wikimirror_core::platform::with_session;
use wikimirror_core::publish::{MigrationOptions, MigrationReport, prepare_mirror, run_migration};
use wikimirror_core::purge::purge_pages;
use wikimirror_core::redirect::{RedirectPlan, RedirectReport, create_redirects};
use wikimirror_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, normalize_for_display, resolve_paths,
};
use wikimirror_core::site::{sanitize_url, url_to_domain};
use wikimirror_core::transform::TransformOptions;
use wikimirror_core::upload::UploadCache;

#[derive(Debug, Parser)]
#[command(
    name = "wikimirror",
    version,
    about = "Mirror a website and publish it to a team wiki"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Crawl a site and write a local mirror")]
    Fetch(FetchArgs),
    #[command(about = "Mirror a site, upload its assets and publish its pages")]
    Upload(UploadArgs),
    #[command(about = "Run the wiki transform over an existing mirror without uploading")]
    Transform(TransformArgs),
    #[command(about = "Blank every page under the team namespace")]
    Purge(PurgeArgs),
}

#[derive(Debug, Args)]
struct FetchArgs {
    url: String,
    #[arg(long, value_name = "PATH", help = "Parent directory of the mirror")]
    dir: Option<PathBuf>,
    #[arg(long, help = "Accept invalid TLS certificates while crawling")]
    insecure: bool,
}

#[derive(Debug, Args)]
struct TeamArgs {
    #[arg(short, long)]
    team: String,
    #[arg(short, long, default_value = "", help = "Offset below the team namespace")]
    offset: String,
    #[arg(short, long, default_value_t = 2021)]
    year: u32,
    #[arg(short, long, help = "Login name (default: WIKIMIRROR_USER)")]
    username: Option<String>,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[command(flatten)]
    team: TeamArgs,
    #[arg(short = 'w', long, help = "Entry URL of the site to mirror")]
    url: String,
    #[arg(short, long, help = "Upload even if the platform already has the file")]
    force: bool,
    #[arg(long, help = "Keep the temporary mirror")]
    keep: bool,
    #[arg(long, help = "Accept invalid TLS certificates while crawling")]
    insecure: bool,
    #[arg(long, help = "Create the configured redirects before uploading")]
    redirect: bool,
    #[arg(long, help = "Ignore and do not update the persistent upload ledger")]
    no_ledger: bool,
}

#[derive(Debug, Args)]
struct TransformArgs {
    dir: PathBuf,
    #[arg(short, long)]
    team: String,
}

#[derive(Debug, Args)]
struct PurgeArgs {
    #[command(flatten)]
    team: TeamArgs,
    #[arg(long, help = "Actually blank the listed pages")]
    yes: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Fetch(args)) => run_fetch(&runtime, args),
        Some(Commands::Upload(args)) => run_upload(&runtime, args),
        Some(Commands::Transform(args)) => run_transform(&runtime, args),
        Some(Commands::Purge(args)) => run_purge(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .init();
}

fn run_fetch(runtime: &RuntimeOptions, args: FetchArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let mut fetcher = HttpFetcher::new(&FetchOptions {
        user_agent: config.user_agent(),
        insecure: args.insecure,
    })?;
    let report = mirror_site(
        &MirrorOptions {
            entry_url: args.url,
            output_dir: args.dir.unwrap_or_else(|| paths.project_root.clone()),
            fonts: config.fonts.clone(),
        },
        &mut fetcher,
    )?;

    println!("fetch");
    print_mirror_report(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_upload(runtime: &RuntimeOptions, args: UploadArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    paths.ensure_state_dirs()?;
    let (username, password) = credentials(args.team.username.as_deref())?;

    let domain = url_to_domain(&sanitize_url(&args.url))?;
    let project_path = paths.work_dir.join(&domain);
    let ledger = if args.no_ledger {
        None
    } else {
        Some(UploadLedger::open(&paths.ledger_path, &args.team.team)?)
    };

    let mut platform = MediaWikiPlatform::new(MediaWikiPlatformConfig::from_config(
        &config,
        args.team.year,
        &args.team.team,
        &args.team.offset,
    ))?;
    info!(
        "uploading {} for {username} to {}",
        args.url,
        config.wiki_url(args.team.year)
    );

    let outcome = with_session(&mut platform, &username, &password, |platform| {
        let redirects = if args.redirect {
            Some(create_redirects(&redirect_plan(&config), platform)?)
        } else {
            None
        };

        let mut fetcher = HttpFetcher::new(&FetchOptions {
            user_agent: config.user_agent(),
            insecure: args.insecure,
        })?;
        let mirror = mirror_site(
            &MirrorOptions {
                entry_url: args.url.clone(),
                output_dir: paths.work_dir.clone(),
                fonts: config.fonts.clone(),
            },
            &mut fetcher,
        )?;

        let mut cache = UploadCache::new();
        let migration = run_migration(
            &MigrationOptions {
                project_path: mirror.project_path.clone(),
                team: args.team.team.clone(),
                mathjax_url: config.mathjax_url().map(ToString::to_string),
                force: args.force,
            },
            platform,
            &mut cache,
            ledger.as_ref(),
        )?;
        Ok((redirects, mirror, migration))
    });

    if args.keep {
        info!("temporary mirror kept at {}", project_path.display());
    } else {
        clean_up(&project_path);
    }

    let (redirects, mirror, migration) = outcome?;
    println!("upload");
    println!("team: {}", args.team.team);
    println!("offset: {}", display_or_root(&args.team.offset));
    print_mirror_report(&mirror);
    if let Some(redirects) = &redirects {
        print_redirect_report(redirects);
    }
    print_migration_report(&migration);
    println!("kept_mirror: {}", format_flag(args.keep));
    print_diagnostics(runtime, &paths);

    let mut errors = migration.errors.clone();
    if let Some(redirects) = &redirects {
        errors.extend(redirects.errors.iter().cloned());
    }
    if !errors.is_empty() {
        println!("error summary:");
        for error in &errors {
            println!("  - {error}");
        }
        bail!("upload finished with {} error(s)", errors.len());
    }
    Ok(())
}

fn run_transform(runtime: &RuntimeOptions, args: TransformArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    if !args.dir.is_dir() {
        bail!("mirror directory not found: {}", args.dir.display());
    }
    let prepared = prepare_mirror(
        &args.dir,
        &TransformOptions {
            team: args.team.clone(),
            mathjax_url: config.mathjax_url().map(ToString::to_string),
        },
    )?;

    println!("transform");
    println!("mirror: {}", normalize_for_display(&args.dir));
    println!("files: {}", prepared.len());
    for file in &prepared {
        println!(
            "file.{}: {} ({} asset reference(s))",
            file.local_path,
            file.bucket.as_str(),
            file.document.asset_refs.len()
        );
        for reference in &file.document.asset_refs {
            println!("  - {reference}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_purge(runtime: &RuntimeOptions, args: PurgeArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let (username, password) = credentials(args.team.username.as_deref())?;
    let mut platform = MediaWikiPlatform::new(MediaWikiPlatformConfig::from_config(
        &config,
        args.team.year,
        &args.team.team,
        &args.team.offset,
    ))?;

    let report = with_session(&mut platform, &username, &password, |platform| {
        purge_pages(platform, !args.yes)
    })?;

    println!("purge");
    println!("team: {}", args.team.team);
    println!("offset: {}", display_or_root(&args.team.offset));
    println!("pages: {}", report.pages.len());
    for page in &report.pages {
        println!("  - {page}");
    }
    println!("purged: {}", report.purged);
    println!("request_count: {}", report.request_count);
    if report.dry_run && !report.pages.is_empty() {
        println!("note: rerun with --yes to blank the listed pages");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn redirect_plan(config: &MirrorConfig) -> RedirectPlan {
    RedirectPlan {
        pages: config.migration.redirect_pages.clone(),
        custom: config.migration.custom_redirects.clone(),
    }
}

fn credentials(username: Option<&str>) -> Result<(String, String)> {
    let username = match username {
        Some(value) => value.to_string(),
        None => env::var("WIKIMIRROR_USER")
            .context("no login name: pass --username or set WIKIMIRROR_USER")?,
    };
    let password =
        env::var("WIKIMIRROR_PASS").context("no password: set WIKIMIRROR_PASS")?;
    Ok((username, password))
}

fn clean_up(project_path: &Path) {
    if !project_path.exists() {
        return;
    }
    match fs::remove_dir_all(project_path) {
        Ok(()) => info!("removed temporary mirror {}", project_path.display()),
        Err(error) => warn!(
            "failed to remove temporary mirror {}: {error}",
            project_path.display()
        ),
    }
}

fn print_mirror_report(report: &MirrorReport) {
    println!("domain: {}", report.domain);
    println!("project_path: {}", normalize_for_display(&report.project_path));
    println!("fetched: {}", report.fetched);
    println!("resources: {}", report.resources.len());
    println!("removals: {}", report.removals.len());
    println!("written: {}", report.written);
    println!("fonts: {}", report.fonts);
    for (url, status) in &report.non_success {
        println!("non_success: {url} (HTTP {status})");
    }
}

fn print_redirect_report(report: &RedirectReport) {
    println!("redirects.created: {}", report.created.len());
    println!("redirects.errors: {}", report.errors.len());
}

fn print_migration_report(report: &MigrationReport) {
    println!("transformed: {}", report.transformed);
    println!("assets.uploaded: {}", report.assets.uploaded);
    println!("assets.cached: {}", report.assets.cached);
    println!("assets.already_on_platform: {}", report.assets.already_on_platform);
    println!("assets.from_ledger: {}", report.assets.from_ledger);
    println!("published: {}", report.published.len());
    for file in &report.published {
        println!("  - {} -> {}", file.local_path, file.remote);
    }
    println!("skipped: {}", report.skipped.len());
    println!("errors: {}", report.errors.len());
    println!("request_count: {}", report.request_count);
    println!("success: {}", format_flag(report.success));
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, MirrorConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn display_or_root(offset: &str) -> &str {
    if offset.is_empty() { "<root>" } else { offset }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
