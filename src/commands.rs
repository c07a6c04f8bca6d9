use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::apps::{encode_apps, load_apps};
use crate::cli::{
    AppsCommand, Cli, Commands, ConfigCommand, DeployArgs, HostkeyArgs, ProbeArgs, RollbackArgs,
    StatusArgs, SyncArgs, VerifyArgs,
};
use crate::config::{effective_config, resolve_config_path, save_config, DeployConfig, Overrides};
use crate::context::DeploymentContext;
use crate::desired::ImageReference;
use crate::error::DeployError;
use crate::exec::CommandExecutor;
use crate::health::verify;
use crate::pipeline::{rollback_to, run_deploy, DeployOptions};
use crate::probe::{ensure_environment, inspect_host};
use crate::reconcile::load_services;
use crate::report::{report, ReportFormat};
use crate::ssh::scan_host_key;
use crate::state::{load_state, save_state};
use crate::sync::{sync_repository, Checkout};

fn exit_code(code: i32) -> u8 {
    u8::try_from(code).ok().filter(|c| *c != 0).unwrap_or(1)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn deploy_options(config: &DeployConfig, no_rollback: bool) -> DeployOptions {
    DeployOptions {
        provision: config.provision_policy(),
        reconcile: config.reconcile_policy(),
        health: config.health_policy(),
        auto_rollback: config.auto_rollback && !no_rollback,
        state_dir: Some(config.state_dir()),
    }
}

fn context<'a>(
    executor: &'a mut dyn CommandExecutor,
    config: &DeployConfig,
    image: Option<ImageReference>,
) -> DeploymentContext<'a> {
    DeploymentContext::new(
        executor,
        config.project_dir.clone(),
        config.compose_settings(),
        image,
    )
}

/// Picks `docker compose` or `docker-compose` for commands that skip provisioning.
fn detect_runtime(ctx: &mut DeploymentContext<'_>) -> Result<()> {
    let host = inspect_host(ctx)?;
    if let Some(runtime) = host.compose_runtime {
        ctx.runtime = runtime;
    }
    Ok(())
}

pub fn dispatch(cli: Cli) -> Result<u8> {
    let config_path = resolve_config_path(cli.config);
    match cli.command {
        Commands::Deploy(args) => deploy(args, &config_path),
        Commands::Probe(args) => probe(args, &config_path),
        Commands::Sync(args) => sync(args, &config_path),
        Commands::Verify(args) => verify_stack(args, &config_path),
        Commands::Rollback(args) => rollback(args, &config_path),
        Commands::Status(args) => status(args, &config_path),
        Commands::Hostkey(args) => hostkey(args),
        Commands::Apps(args) => match args.command {
            AppsCommand::Encode(args) => {
                let apps = load_apps(&args.file)?;
                let encoded = encode_apps(&apps)?;
                if args.export {
                    println!("export APPS_JSON_BASE64={encoded}");
                } else {
                    println!("{encoded}");
                }
                Ok(0)
            }
        },
        Commands::Config(args) => match args.command {
            ConfigCommand::Init(init) => {
                if config_path.exists() && !init.force {
                    bail!(
                        "Config already exists at {} (use --force to overwrite)",
                        config_path.display()
                    );
                }
                save_config(&config_path, &DeployConfig::default())?;
                println!("Wrote {}", config_path.display());
                Ok(0)
            }
            ConfigCommand::Show => {
                let config = effective_config(&config_path, &Overrides::default())?;
                print_json(&config.redacted())?;
                Ok(0)
            }
        },
    }
}

fn deploy(args: DeployArgs, config_path: &Path) -> Result<u8> {
    let mut overrides = args.target.overrides();
    overrides.image = args.image;
    overrides.git_ref = args.git_ref;
    let config = effective_config(config_path, &overrides)?;
    let desired = config.desired_revision()?;
    let options = deploy_options(&config, args.no_rollback);

    let mut executor = config.connect()?;
    let mut ctx = context(executor.as_mut(), &config, desired.image.clone());
    let result = run_deploy(&mut ctx, &desired, &options);

    let format = if args.json {
        ReportFormat::Json
    } else {
        ReportFormat::Text
    };
    report(&result, format, options.state_dir.as_deref());
    Ok(if result.succeeded {
        0
    } else {
        exit_code(result.exit_code)
    })
}

fn probe(args: ProbeArgs, config_path: &Path) -> Result<u8> {
    let config = effective_config(config_path, &args.target.overrides())?;
    let mut executor = config.connect()?;
    let mut ctx = context(executor.as_mut(), &config, None);
    let outcome = if args.install {
        ensure_environment(&mut ctx, config.provision_policy())
    } else {
        inspect_host(&mut ctx)
    };
    let state = match outcome {
        Ok(state) => state,
        Err(err) => {
            let err = DeployError::from(err);
            eprintln!("{err}");
            return Ok(exit_code(err.exit_code()));
        }
    };
    if args.json {
        print_json(&state)?;
    } else {
        let tools: Vec<&str> = state.tools_installed.iter().map(|t| t.as_str()).collect();
        println!("host:        {}", ctx.host_ref);
        println!("tools:       {}", tools.join(", "));
        println!(
            "compose:     {}",
            state.compose_runtime.map(|r| r.program()).unwrap_or("missing")
        );
        println!(
            "project dir: {} (exists: {}, git: {})",
            ctx.project_dir, state.project_dir_exists, state.is_git_repo
        );
    }
    Ok(0)
}

fn sync(args: SyncArgs, config_path: &Path) -> Result<u8> {
    let mut overrides = args.target.overrides();
    overrides.git_ref = args.git_ref;
    let config = effective_config(config_path, &overrides)?;
    let desired = config.desired_revision()?;
    let mut executor = config.connect()?;
    let mut ctx = context(executor.as_mut(), &config, None);
    let checkout = match sync_repository(&mut ctx, &desired) {
        Ok(checkout) => checkout,
        Err(err) => {
            let err = DeployError::from(err);
            eprintln!("{err}");
            return Ok(exit_code(err.exit_code()));
        }
    };
    if args.json {
        print_json(&checkout)?;
    } else {
        println!(
            "{} at {} ({})",
            ctx.project_dir,
            checkout.revision,
            checkout.branch.as_deref().unwrap_or("detached")
        );
        if let Some(stash) = &checkout.stashed {
            println!("local changes stashed as {stash}");
        }
    }
    Ok(0)
}

fn verify_stack(args: VerifyArgs, config_path: &Path) -> Result<u8> {
    let config = effective_config(config_path, &args.target.overrides())?;
    let mut executor = config.connect()?;
    let mut ctx = context(executor.as_mut(), &config, config.image_reference()?);
    detect_runtime(&mut ctx)?;
    let outcome = load_services(&mut ctx)
        .map_err(DeployError::from)
        .and_then(|services| {
            verify(&mut ctx, &services, &config.health_policy()).map_err(DeployError::from)
        });
    match outcome {
        Ok(observed) => {
            if args.json {
                print_json(&observed)?;
            } else {
                for svc in &observed {
                    println!("{:<24} {:?} {:?}", svc.name, svc.state, svc.health);
                }
            }
            Ok(0)
        }
        Err(err) => {
            if args.json {
                print_json(&err.failing_services())?;
            }
            eprintln!("{err}");
            for svc in err.failing_services() {
                eprintln!("  {} ({:?}, {:?})", svc.name, svc.state, svc.health);
                for line in &svc.log_tail {
                    eprintln!("    | {line}");
                }
            }
            Ok(exit_code(err.exit_code()))
        }
    }
}

fn rollback(args: RollbackArgs, config_path: &Path) -> Result<u8> {
    let config = effective_config(config_path, &args.target.overrides())?;
    let state_dir = config.state_dir();
    let mut state = load_state(&state_dir)?;
    let target = match &args.image {
        Some(image) => image.clone(),
        None => state
            .rollback_target(None)
            .map(str::to_string)
            .context("No previous image available for rollback")?,
    };
    let target: ImageReference = target
        .parse()
        .with_context(|| format!("Invalid rollback image: {target}"))?;

    let mut executor = config.connect()?;
    let mut ctx = context(executor.as_mut(), &config, None);
    detect_runtime(&mut ctx)?;
    let checkout = Checkout::inspect(&mut ctx).map_err(DeployError::from)?;
    let outcome = rollback_to(&mut ctx, &checkout, target, &deploy_options(&config, true));

    if outcome.succeeded {
        state.record_rollback(&outcome.target_image, &checkout.revision);
        save_state(&state_dir, &state)?;
    }
    if args.json {
        print_json(&outcome)?;
    } else if outcome.succeeded {
        println!("Rolled back to {}", outcome.target_image);
    } else {
        println!(
            "Rollback to {} failed: {}",
            outcome.target_image,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(if outcome.succeeded { 0 } else { 1 })
}

fn status(args: StatusArgs, config_path: &Path) -> Result<u8> {
    let config = effective_config(config_path, &Overrides::default())?;
    let state = load_state(&config.state_dir())?;
    if args.json {
        print_json(&state)?;
        return Ok(0);
    }
    println!("current:  {}", state.current_image.as_deref().unwrap_or("-"));
    println!("previous: {}", state.previous_image.as_deref().unwrap_or("-"));
    println!("revision: {}", state.last_revision.as_deref().unwrap_or("-"));
    for release in state.history.iter().rev().take(10) {
        println!(
            "  {} {} {} {}",
            release.deployed_at,
            if release.succeeded { "ok  " } else { "FAIL" },
            release.image.as_deref().unwrap_or("-"),
            release.revision.as_deref().unwrap_or("-")
        );
    }
    Ok(0)
}

fn hostkey(args: HostkeyArgs) -> Result<u8> {
    let scan = scan_host_key(&args.host, args.port)?;
    if args.json {
        print_json(&scan)?;
    } else {
        println!("{} {}", scan.key_type, scan.fingerprint_sha256);
        println!("{}", scan.known_hosts_entry);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_fit_a_byte() {
        assert_eq!(exit_code(31), 31);
        assert_eq!(exit_code(255), 255);
        assert_eq!(exit_code(0), 1);
        assert_eq!(exit_code(-1), 1);
        assert_eq!(exit_code(300), 1);
    }

    #[test]
    fn no_rollback_flag_wins_over_config() {
        let config = DeployConfig::default();
        assert!(deploy_options(&config, false).auto_rollback);
        assert!(!deploy_options(&config, true).auto_rollback);
    }
}
