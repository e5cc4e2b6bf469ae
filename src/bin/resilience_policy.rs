//! resilience-policy: 弹性策略的加载、校验与查看工具
//!
//! Usage:
//!   resilience-policy [show] [--file <path>] [--env <name>]    Print the effective policy as JSON
//!   resilience-policy validate [--file <path>] [--env <name>]  Validate a policy; exit 1 if invalid
//!   resilience-policy health [--file <path>] [--env <name>]    Build a manager and print its health

use anyhow::{bail, Context};
use call_resilience::{Environment, ResilienceManager, ResiliencePolicy};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("call_resilience=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("show");
    let rest = args.get(2..).unwrap_or(&[]);

    let outcome = match command {
        "show" => cmd_show(rest),
        "validate" => cmd_validate(rest),
        "health" => cmd_health(rest).await,
        "version" | "--version" | "-V" => {
            println!("resilience-policy {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = outcome {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"resilience-policy: 弹性策略工具

USAGE:
    resilience-policy <COMMAND> [OPTIONS]

COMMANDS:
    show                 Print the effective policy as JSON (default)
    validate             Validate the policy and list every problem
    health               Build a manager from the policy and print its health snapshot
    version              Show version information
    help                 Show this help message

OPTIONS:
    --file <path>        Policy YAML (default: $RESILIENCE_POLICY_PATH, else built-in)
    --env <name>         production | development | default (default: $RESILIENCE_ENV)"#
    );
}

struct Options {
    file: Option<String>,
    env: Option<Environment>,
}

fn parse_options(args: &[String]) -> anyhow::Result<Options> {
    let mut opts = Options {
        file: None,
        env: None,
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--file" => {
                opts.file = Some(iter.next().context("--file needs a path")?.clone());
            }
            "--env" => {
                let name = iter.next().context("--env needs a name")?;
                opts.env = Some(name.parse().map_err(anyhow::Error::msg)?);
            }
            other => bail!("unexpected argument '{other}'"),
        }
    }
    Ok(opts)
}

/// Base document plus environment profile, not yet validated.
fn load(args: &[String]) -> anyhow::Result<(Environment, ResiliencePolicy)> {
    let opts = parse_options(args)?;
    let file = opts
        .file
        .or_else(|| std::env::var(call_resilience::policy::POLICY_PATH_VAR).ok())
        .filter(|p| !p.trim().is_empty());
    let base = match file {
        Some(path) => ResiliencePolicy::from_file(&path)
            .with_context(|| format!("failed to load policy from {path}"))?,
        None => ResiliencePolicy::default(),
    };
    let env = opts.env.unwrap_or_else(Environment::from_env);
    Ok((env, env.apply(&base)))
}

fn cmd_show(args: &[String]) -> anyhow::Result<()> {
    let (env, policy) = load(args)?;
    policy.validate()?;
    let doc = serde_json::json!({
        "environment": env,
        "policy": policy,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn cmd_validate(args: &[String]) -> anyhow::Result<()> {
    let (env, policy) = load(args)?;
    let problems = policy.problems();
    if problems.is_empty() {
        println!(
            "Policy OK ({env}): {} rules, {} breakers, {} handlers, {} retry classes",
            policy.rate_limiting.rules.len(),
            policy.circuit_breakers.len(),
            policy.backpressure.len(),
            policy.retries.len()
        );
        return Ok(());
    }
    for (path, msg) in &problems {
        println!("  {path}: {msg}");
    }
    bail!("{} invalid policy value(s)", problems.len())
}

async fn cmd_health(args: &[String]) -> anyhow::Result<()> {
    let (_, policy) = load(args)?;
    let manager = ResilienceManager::new(policy, None).await?;
    let health = manager.get_health_status();
    println!("{}", serde_json::to_string_pretty(&health)?);
    manager.shutdown().await;
    Ok(())
}
