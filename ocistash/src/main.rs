mod commands;

use std::path::PathBuf;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use ocistash_backend::{resolve, Config, OciBackend, ProcessEnv};
use ocistash_common::{FileType, Handle};

const REPOSITORY_ENV_VAR: &str = "OCI_REPOSITORY";

const USAGE: &str = "\
usage: ocistash [--config FILE] [-o KEY=VALUE]... [REPOSITORY] COMMAND [ARGS]

REPOSITORY is oci:bucket[/prefix]; defaults to $OCI_REPOSITORY.

commands:
  init                          create the bucket if needed
  ls TYPE                       list blobs of a type
  stat TYPE NAME                show the size of a blob
  cat TYPE NAME [OFFSET LENGTH] write a blob (or part of it) to stdout
  put TYPE NAME FILE            upload a file as a blob
  rm TYPE NAME                  remove a blob
  migrate-layout LAYOUT         move every blob into another key layout
  location                      print the repository location";

#[derive(Debug, PartialEq)]
pub enum Command {
    Init,
    Ls(FileType),
    Stat(Handle),
    Cat { handle: Handle, offset: u64, length: usize },
    Put { handle: Handle, file: PathBuf },
    Rm(Handle),
    MigrateLayout(String),
    Location,
}

#[derive(Debug)]
struct Args {
    config_file: Option<PathBuf>,
    options: Vec<(String, String)>,
    repository: String,
    command: Command,
}

impl Args {
    fn parse(args: &[String], env_repository: Option<String>) -> anyhow::Result<Self> {
        let mut config_file = None;
        let mut options = Vec::new();
        let mut positional = Vec::new();

        let mut it = args.iter();
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--config" => {
                    let path = it.next().context("--config needs a file")?;
                    config_file = Some(PathBuf::from(path));
                }
                "-o" => {
                    let opt = it.next().context("-o needs KEY=VALUE")?;
                    let (k, v) = opt
                        .split_once('=')
                        .with_context(|| format!("option {:?} is not KEY=VALUE", opt))?;
                    options.push((k.to_string(), v.to_string()));
                }
                "-h" | "--help" => bail!("{}", USAGE),
                _ => positional.push(arg.as_str()),
            }
        }

        let repository = if positional.first().is_some_and(|p| p.starts_with("oci:")) {
            positional.remove(0).to_string()
        } else {
            env_repository.with_context(|| format!("no repository given\n\n{}", USAGE))?
        };
        let command = parse_command(&positional)?;

        Ok(Self { config_file, options, repository, command })
    }
}

fn parse_handle(t: &str, name: Option<&&str>) -> anyhow::Result<Handle> {
    let file_type: FileType = t.parse().map_err(anyhow::Error::msg)?;
    if file_type == FileType::Config {
        return Ok(Handle::config());
    }
    let name = name.with_context(|| format!("missing name for {}", file_type))?;
    let handle = Handle::new(file_type, *name);
    handle.check()?;
    Ok(handle)
}

fn parse_command(args: &[&str]) -> anyhow::Result<Command> {
    let Some((cmd, rest)) = args.split_first() else {
        bail!("no command given\n\n{}", USAGE);
    };
    let cmd = match (*cmd, rest) {
        ("init", []) => Command::Init,
        ("location", []) => Command::Location,
        ("ls", [t]) => Command::Ls(t.parse().map_err(anyhow::Error::msg)?),
        ("stat", [t, name @ ..]) => Command::Stat(parse_handle(t, name.first())?),
        ("rm", [t, name @ ..]) => Command::Rm(parse_handle(t, name.first())?),
        ("cat", [t, more @ ..]) => {
            let handle = parse_handle(t, more.first())?;
            let skip = usize::from(handle.file_type != FileType::Config);
            let (offset, length) = match &more[skip.min(more.len())..] {
                [] => (0, 0),
                [offset, length] => (
                    offset.parse().context("invalid offset")?,
                    length.parse().context("invalid length")?,
                ),
                _ => bail!("cat takes both OFFSET and LENGTH or neither"),
            };
            Command::Cat { handle, offset, length }
        }
        ("put", [t, more @ ..]) => {
            let handle = parse_handle(t, more.first())?;
            let want = 1 + usize::from(handle.file_type != FileType::Config);
            let file = more.last().filter(|_| more.len() == want);
            let file = file.context("put needs a FILE")?;
            Command::Put { handle, file: PathBuf::from(*file) }
        }
        ("migrate-layout", [layout]) => Command::MigrateLayout(layout.to_string()),
        (other, _) => bail!("unknown command or wrong arguments: {}\n\n{}", other, USAGE),
    };
    Ok(cmd)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = Args::parse(&argv, std::env::var(REPOSITORY_ENV_VAR).ok())?;

    let parsed = Config::parse(&args.repository)?;
    let mut cfg = match &args.config_file {
        Some(path) => Config {
            bucket: parsed.bucket,
            prefix: parsed.prefix,
            ..Config::load(path)?
        },
        None => parsed,
    };
    for (k, v) in &args.options {
        cfg.apply_option(k, v)?;
    }
    let resolved = resolve(cfg, &ProcessEnv, "")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let create = args.command == Command::Init;
    let be = OciBackend::connect(&resolved, create)
        .await
        .with_context(|| format!("unable to open repository {}", args.repository))?;
    info!(repository = %args.repository, "Repository opened");

    commands::run(&be, &cancel, args.command).await
}
