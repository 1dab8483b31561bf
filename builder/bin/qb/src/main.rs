//! `qb` — the build orchestrator front-end.

use std::path::PathBuf;
use std::process::{Command, ExitCode};

use anyhow::{bail, Context, Result};
use buildconfig::{Component, Config, Distribution, Stage, Template};
use clap::{Parser, Subcommand};
use cliutil::{cli_main, LoggingConfig};
use plugins::{installer_jobs, Pipeline, PluginManager, RunOptions};
use tracing::info;

#[derive(Parser)]
#[command(name = "qb", about = "Qubes OS build orchestrator", version)]
struct Cli {
    /// Increase log verbosity.
    #[arg(long, global = true, overrides_with = "no_verbose")]
    verbose: bool,
    #[arg(long, global = true, hide = true)]
    no_verbose: bool,

    /// Print full traceback on exception.
    #[arg(long, global = true, overrides_with = "no_debug")]
    debug: bool,
    #[arg(long, global = true, hide = true)]
    no_debug: bool,

    /// Path to configuration file.
    #[arg(long, default_value = "builder.yml", global = true)]
    builder_conf: PathBuf,

    /// Path to log file to be created.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Specify component to treat (can be repeated).
    #[arg(short = 'c', long = "component", global = true)]
    components: Vec<String>,

    /// Specify distribution to treat (can be repeated).
    #[arg(short = 'd', long = "distribution", global = true)]
    distributions: Vec<String>,

    /// Specify template to treat (can be repeated).
    #[arg(short = 't', long = "template", global = true)]
    templates: Vec<String>,

    /// Override configuration, `KEY[:SUB…]=VALUE` or `KEY+VALUE`
    /// (can be repeated).
    #[arg(short = 'o', long = "option", global = true)]
    options: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Standard component build pipeline.
    Package {
        /// Stages to run, in order; `all` runs the configured pipeline.
        #[arg(required = true)]
        stages: Vec<String>,
    },
    /// Template build pipeline.
    Template {
        #[arg(required = true)]
        stages: Vec<String>,
        /// Set template timestamp (YYYYMMDDHHMM) instead of current time.
        #[arg(long)]
        template_timestamp: Option<String>,
    },
    /// Repository operations.
    Repository {
        #[command(subcommand)]
        command: RepositoryCommands,
    },
    /// Installer ISO pipeline.
    Installer {
        #[arg(required = true)]
        stages: Vec<String>,
    },
    /// Configuration introspection.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Purge generated state.
    Cleanup {
        #[arg(required = true)]
        targets: Vec<String>,
    },
}

#[derive(Subcommand)]
enum RepositoryCommands {
    /// Publish packages or templates into the given repository.
    Publish {
        repository: String,
        /// Override the minimum-age rule for stable promotion.
        #[arg(long)]
        ignore_min_age: bool,
    },
    /// Withdraw packages or templates from the given repository.
    Unpublish { repository: String },
    /// Show where component artifacts are currently published.
    CheckReleaseStatusForComponent,
    /// Show where template artifacts are currently published.
    CheckReleaseStatusForTemplate,
    /// Upload the given repository to the configured mirror.
    Upload { repository: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print a top-level configuration value.
    GetVar { key: String },
    GetComponents,
    GetDistributions,
    GetTemplates,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let logging = LoggingConfig {
        verbose: cli.verbose && !cli.no_verbose,
        log_file: cli.log_file.clone(),
    };
    cli_main(|| run(cli), logging)
}

fn run(cli: Cli) -> Result<()> {
    // Flags become the last configuration layer so config and CLI agree.
    let mut options = cli.options.clone();
    if cli.verbose {
        options.push("verbose=true".to_string());
    }
    if cli.no_verbose {
        options.push("verbose=false".to_string());
    }
    if cli.debug {
        options.push("debug=true".to_string());
    }
    if cli.no_debug {
        options.push("debug=false".to_string());
    }

    let config = Config::from_file(&cli.builder_conf, &options)?;
    let manager = PluginManager::discover(config.plugins_dirs())?;

    let components = select(config.components(), &cli.components, |c: &&Component| {
        c.name.clone()
    })?;
    let distributions = select(
        config.distributions(),
        &cli.distributions,
        |d: &&Distribution| d.distribution().to_string(),
    )?;
    let templates = select(config.templates(), &cli.templates, |t: &&Template| {
        t.name.clone()
    })?;

    let mut pipeline = Pipeline::new(&config, &manager);

    match &cli.command {
        Commands::Package { stages } => {
            if stages.iter().any(|s| s == "diff") {
                return component_diff(&components);
            }
            let options = RunOptions::default();
            if stages.iter().any(|s| s == "all") {
                pipeline.run_all(&components, &distributions, &[], &options)?;
            } else {
                let stages = parse_stages(stages)?;
                pipeline.run_stages(&stages, &components, &distributions, &[], &options)?;
            }
        }
        Commands::Template {
            stages,
            template_timestamp,
        } => {
            let options = RunOptions {
                template_timestamp: template_timestamp.clone(),
                ..Default::default()
            };
            if stages.iter().any(|s| s == "all") {
                pipeline.run_all(&[], &[], &templates, &options)?;
            } else {
                let stages = parse_stages(stages)?;
                pipeline.run_stages(&stages, &[], &[], &templates, &options)?;
            }
        }
        Commands::Repository { command } => {
            run_repository(&mut pipeline, &components, &distributions, &templates, &config, command)?
        }
        Commands::Installer { stages } => {
            for stage_name in stages {
                let stage = Stage::from_name_or_alias(stage_name)?;
                let ctx = plugins::JobContext {
                    config: &config,
                    manager: &manager,
                };
                for mut job in installer_jobs(&config, stage)? {
                    info!("Running '{}'.", job.name());
                    job.run(&ctx, &RunOptions::default())?;
                }
            }
        }
        Commands::Config { command } => run_config(&config, command)?,
        Commands::Cleanup { targets } => run_cleanup(&config, targets)?,
    }
    Ok(())
}

fn parse_stages(names: &[String]) -> Result<Vec<Stage>> {
    names
        .iter()
        .map(|name| Ok(Stage::from_name_or_alias(name)?))
        .collect()
}

fn select<'a, T, F: Fn(&&'a T) -> String>(
    all: &'a [T],
    requested: &[String],
    key: F,
) -> Result<Vec<&'a T>> {
    if requested.is_empty() {
        return Ok(all.iter().collect());
    }
    requested
        .iter()
        .map(|name| {
            all.iter()
                .find(|item| key(item) == *name)
                .with_context(|| format!("No such entry: {name}"))
        })
        .collect()
}

fn run_repository<'a>(
    pipeline: &mut Pipeline<'a>,
    components: &[&'a Component],
    distributions: &[&'a Distribution],
    templates: &[&'a Template],
    config: &Config,
    command: &RepositoryCommands,
) -> Result<()> {
    // A template repository names template jobs; anything else targets the
    // component matrix.
    let matrix = |repository: &str| {
        if plugins::publish::TEMPLATE_REPOSITORIES.contains(&repository) {
            (&[] as &[&Component], &[] as &[&Distribution], templates)
        } else {
            (components, distributions, &[] as &[&Template])
        }
    };

    match command {
        RepositoryCommands::Publish {
            repository,
            ignore_min_age,
        } => {
            let options = RunOptions {
                repository_publish: Some(repository.clone()),
                ignore_min_age: *ignore_min_age,
                ..Default::default()
            };
            let (components, distributions, templates) = matrix(repository);
            pipeline.run_stages(
                &[Stage::Publish],
                components,
                distributions,
                templates,
                &options,
            )?;
        }
        RepositoryCommands::Unpublish { repository } => {
            let options = RunOptions {
                repository_publish: Some(repository.clone()),
                unpublish: true,
                ..Default::default()
            };
            let (components, distributions, templates) = matrix(repository);
            pipeline.run_stages(
                &[Stage::Publish],
                components,
                distributions,
                templates,
                &options,
            )?;
        }
        RepositoryCommands::Upload { repository } => {
            let options = RunOptions {
                repository_publish: Some(repository.clone()),
                ..Default::default()
            };
            let (components, distributions, templates) = matrix(repository);
            pipeline.run_stages(
                &[Stage::Upload],
                components,
                distributions,
                templates,
                &options,
            )?;
        }
        RepositoryCommands::CheckReleaseStatusForComponent => {
            for component in components {
                for dist in distributions {
                    let Ok(verrel) = component.verrel() else {
                        println!("{component}:{dist}: no fetched source");
                        continue;
                    };
                    let dir = config.artifacts().dist_artifacts_dir(
                        &component.name,
                        &verrel,
                        dist.distribution(),
                        "publish",
                    );
                    let mut repositories = Vec::new();
                    if let Ok(entries) = std::fs::read_dir(&dir) {
                        for entry in entries.flatten() {
                            let name = entry.file_name().to_string_lossy().into_owned();
                            let Some(basename) = name.strip_suffix(".publish.yml") else {
                                continue;
                            };
                            let record = artifacts::read_info(&dir, "publish", basename)?;
                            for publish in record.repository_publish {
                                repositories
                                    .push(format!("{} ({})", publish.name, publish.timestamp));
                            }
                        }
                    }
                    if repositories.is_empty() {
                        println!("{component}:{dist}: not published");
                    } else {
                        repositories.sort();
                        repositories.dedup();
                        println!("{component}:{dist}: {}", repositories.join(", "));
                    }
                }
            }
        }
        RepositoryCommands::CheckReleaseStatusForTemplate => {
            let templates_dir = config.artifacts().templates_dir();
            for template in templates {
                let record = artifacts::read_info(&templates_dir, "publish", &template.name)?;
                if record.repository_publish.is_empty() {
                    println!("{template}: not published");
                } else {
                    let repositories: Vec<String> = record
                        .repository_publish
                        .iter()
                        .map(|p| format!("{} ({})", p.name, p.timestamp))
                        .collect();
                    println!("{template}: {}", repositories.join(", "));
                }
            }
        }
    }
    Ok(())
}

fn run_config(config: &Config, command: &ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::GetVar { key } => match config.get(key) {
            Some(value) => print!("{}", serde_yaml::to_string(value)?),
            None => bail!("No such configuration key: {key}"),
        },
        ConfigCommands::GetComponents => {
            for component in config.components() {
                println!("{component}");
            }
        }
        ConfigCommands::GetDistributions => {
            for dist in config.distributions() {
                println!("{}", dist.distribution());
            }
        }
        ConfigCommands::GetTemplates => {
            for template in config.templates() {
                println!("{template}");
            }
        }
    }
    Ok(())
}

/// Shows local modifications of fetched component sources.
fn component_diff(components: &[&Component]) -> Result<()> {
    for component in components {
        if !component.source_dir.exists() {
            continue;
        }
        let status = Command::new("git")
            .arg("-C")
            .arg(&component.source_dir)
            .args(["diff", "--stat", "HEAD"])
            .status()
            .context("Cannot run git")?;
        if !status.success() {
            bail!("{component}: git diff failed.");
        }
    }
    Ok(())
}

fn run_cleanup(config: &Config, targets: &[String]) -> Result<()> {
    let layout = config.artifacts();
    for target in targets {
        let directories: Vec<PathBuf> = match target.as_str() {
            "distfiles" => vec![layout.distfiles_dir()],
            "build-artifacts" => {
                vec![layout.root().join("components"), layout.root().join("repository")]
            }
            "logs" => vec![layout.logs_dir()],
            "tmp" => vec![layout.tmp_dir()],
            "cache" => vec![layout.cache_dir()],
            "all" => vec![
                layout.distfiles_dir(),
                layout.root().join("components"),
                layout.root().join("repository"),
                layout.logs_dir(),
                layout.tmp_dir(),
                layout.cache_dir(),
            ],
            other => bail!("Unknown cleanup target '{other}'."),
        };
        for directory in directories {
            info!("Removing '{}'.", directory.display());
            fileutil::remove_path(&directory)?;
        }
    }
    Ok(())
}
