use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use updater::runner::{self, RESULT_REQUIRES_RESTART};
use updater::{CancelFlag, ConsoleUi, PatchSpec};

#[derive(Parser)]
#[command(name = "updater", about = "Installation patch creator and installer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch artifact by comparing old and new directories
    Create {
        /// Description of the old build
        old_description: String,
        /// Description of the new build
        new_description: String,
        /// Path to the old (installed) directory
        old_folder: PathBuf,
        /// Path to the new directory
        new_folder: PathBuf,
        /// Output path for the patch artifact
        patch_file: PathBuf,
        /// ignored=a;b critical=a;b optional=a;b delete=regex;regex
        #[arg(value_name = "KEY=FILES")]
        params: Vec<String>,
        /// Digest zip and jar files as plain bytes
        #[arg(long = "zip_as_binary")]
        zip_as_binary: bool,
        /// Treat every conflict as blocking
        #[arg(long)]
        strict: bool,
        /// Zip whose entries are copied into the artifact
        #[arg(long)]
        jar: Option<PathBuf>,
    },
    /// Install a patch artifact into a directory
    Install {
        /// Exit with 0 instead of the restart-required code on success
        #[arg(long)]
        exit0: bool,
        /// Patch artifact to install (defaults to this executable)
        #[arg(long)]
        patch: Option<PathBuf>,
        /// Installation to update
        dest_folder: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Cancellation requested");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Create {
            old_description,
            new_description,
            old_folder,
            new_folder,
            patch_file,
            params,
            zip_as_binary,
            strict,
            jar,
        } => {
            println!("Creating patch...");
            println!("  Old: {} ({})", old_folder.display(), old_description);
            println!("  New: {} ({})", new_folder.display(), new_description);
            println!("  Output: {}", patch_file.display());

            let spec = PatchSpec::new()
                .old_build_description(old_description)
                .new_build_description(new_description)
                .old_folder(old_folder)
                .new_folder(new_folder)
                .patch_file(patch_file)
                .jar_file(jar)
                .ignored_files(runner::extract_files(&params, "ignored"))
                .critical_files(runner::extract_files(&params, "critical"))
                .optional_files(runner::extract_files(&params, "optional"))
                .delete_files(runner::extract_files(&params, "delete"))
                .zip_as_binary(zip_as_binary)
                .strict(strict);

            let start = Instant::now();
            let patch = tokio::task::spawn_blocking(move || {
                runner::create(&spec, &mut ConsoleUi::new(cancel))
            })
            .await
            .context("Patch creation task failed")??;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            println!("  Actions: {}", patch.actions().len());
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Install {
            exit0,
            patch,
            dest_folder,
        } => {
            let artifact = match patch {
                Some(patch) => patch,
                None => std::env::current_exe().context("Cannot resolve the patch artifact path")?,
            };
            println!("Installing patch...");
            println!("  Target: {}", dest_folder.display());
            println!("  Patch: {}", artifact.display());

            let start = Instant::now();
            let result = tokio::task::spawn_blocking(move || {
                runner::install(&artifact, &dest_folder, &mut ConsoleUi::new(cancel))
            })
            .await
            .context("Install task failed")?;
            let elapsed = start.elapsed();

            // Failures were already reported by the installer.
            let Ok(summary) = result else {
                std::process::exit(1);
            };

            println!("\nPatch applied successfully!");
            println!("  Files created: {}", summary.created);
            println!("  Files updated: {}", summary.updated);
            println!("  Files moved: {}", summary.moved);
            println!("  Files deleted: {}", summary.deleted);
            println!("  Skipped: {}", summary.skipped);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());

            if !exit0 {
                std::process::exit(RESULT_REQUIRES_RESTART);
            }
        }
    }

    Ok(())
}
