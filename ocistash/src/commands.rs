use std::io::{Read, Write};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use ocistash_common::layout::layout_by_name;
use ocistash_common::{Backend, FileInfo, FileReader, FileType, Handle};

use crate::Command;

pub async fn run(be: &dyn Backend, cancel: &CancellationToken, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Init => {
            match be.stat(cancel, &Handle::config()).await {
                Ok(_) => info!(location = %be.location(), "Repository config already present"),
                Err(e) if be.is_not_exist(&e) => {}
                Err(e) => return Err(e.into()),
            }
            println!("bucket ready at {}", be.location());
        }
        Command::Location => println!("{}", be.location()),
        Command::Ls(t) => {
            let mut out = std::io::stdout();
            be.list(cancel, t, &mut |fi: FileInfo| {
                writeln!(out, "{}\t{}", fi.name, fi.size)?;
                Ok(())
            })
            .await?;
        }
        Command::Stat(h) => {
            let fi = be.stat(cancel, &h).await.with_context(|| format!("stat {}", h))?;
            println!("{}\t{}", fi.name, fi.size);
        }
        Command::Cat { handle, offset, length } => {
            be.load(cancel, &handle, length, offset, &mut |rd: &mut dyn Read| {
                std::io::copy(rd, &mut std::io::stdout().lock())?;
                Ok(())
            })
            .await
            .with_context(|| format!("load {}", handle))?;
        }
        Command::Put { handle, file } => {
            let mut rd = FileReader::open(&file)
                .await
                .with_context(|| format!("open {}", file.display()))?;
            be.save(cancel, &handle, &mut rd).await.with_context(|| format!("save {}", handle))?;
            info!(handle = %handle, file = %file.display(), "Saved");
        }
        Command::Rm(h) => {
            be.remove(cancel, &h).await.with_context(|| format!("remove {}", h))?;
        }
        Command::MigrateLayout(name) => migrate_layout(be, cancel, &name).await?,
    }
    Ok(())
}

/// Rename every blob into the key layout `name`. Safe to run again after
/// an interruption.
async fn migrate_layout(
    be: &dyn Backend,
    cancel: &CancellationToken,
    name: &str,
) -> anyhow::Result<()> {
    let target = layout_by_name(name, be.path())?.context("a target layout name is required")?;

    let mut moved = 0usize;
    for t in FileType::LISTABLE {
        let mut names = Vec::new();
        be.list(cancel, t, &mut |fi: FileInfo| {
            names.push(fi.name);
            Ok(())
        })
        .await?;

        for n in names {
            let h = Handle::new(t, n);
            be.rename(cancel, &h, target.as_ref())
                .await
                .with_context(|| format!("rename {}", h))?;
            moved += 1;
        }
    }
    be.rename(cancel, &Handle::config(), target.as_ref()).await?;

    info!(layout = target.name(), moved, "Layout migration finished");
    Ok(())
}
