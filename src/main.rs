use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use colored::Colorize;
use console::Emoji;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use url::Url;

use podqueue::{
    DownloadItem, DownloadService, Metadata, ReqwestTransport, ServiceOptions, TransferEvent,
};

// Emoji with fallback for terminals without Unicode support
static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static TRASH: Emoji<'_, '_> = Emoji("🗑️  ", "[-] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");

/// Download files through a bounded background queue
#[derive(Parser, Debug)]
#[command(name = "podqueue")]
#[command(about = "Download podcast episodes through a bounded background queue")]
#[command(version)]
struct Args {
    /// Directory downloads are stored in
    output_dir: PathBuf,

    /// URLs to download
    urls: Vec<String>,

    /// Maximum number of concurrent downloads
    #[arg(short = 'c', long)]
    concurrent: Option<usize>,

    /// Extension for downloaded files
    #[arg(short, long)]
    extension: Option<String>,

    /// JSON file with service options
    #[arg(long)]
    config: Option<PathBuf>,

    /// List finished downloads
    #[arg(short, long)]
    list: bool,

    /// Delete the download with this id
    #[arg(short, long, value_name = "ID")]
    delete: Vec<String>,

    /// Delete the whole output directory
    #[arg(long)]
    delete_all: bool,

    /// Print the size of the output directory
    #[arg(short, long)]
    size: bool,

    /// Quiet mode - suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

fn load_options(args: &Args) -> Result<ServiceOptions> {
    let mut options = match &args.config {
        Some(path) => ServiceOptions::from_json_file(path).context("Failed to load options")?,
        None => ServiceOptions::default(),
    };
    if let Some(concurrent) = args.concurrent {
        options.max_concurrent = concurrent;
    }
    if let Some(extension) = &args.extension {
        options.file_extension = extension.clone();
    }
    Ok(options)
}

/// Derive an item from a URL, using the file stem of its last path segment as id
fn item_for_url(raw: &str) -> Result<DownloadItem> {
    let url = Url::parse(raw).with_context(|| format!("Invalid URL: {raw}"))?;

    let filename = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| url.host_str().unwrap_or("download"))
        .to_string();
    let id = filename
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| filename.clone());

    Ok(DownloadItem::new(id, filename, url))
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

async fn list(service: &DownloadService) -> Result<()> {
    let records = service
        .downloads()
        .await
        .context("Failed to list downloads")?;

    if records.is_empty() {
        println!("{}", "No downloads".dimmed());
        return Ok(());
    }
    for record in records {
        println!(
            "  {} {} {} {}",
            record.id.cyan(),
            record.title,
            format_bytes(record.bytes).dimmed(),
            record.downloaded_at.dimmed()
        );
    }
    Ok(())
}

async fn delete(service: &DownloadService, ids: &[String]) -> Result<()> {
    let records = service
        .downloads()
        .await
        .context("Failed to list downloads")?;

    for id in ids {
        let Some(record) = records.iter().find(|record| &record.id == id) else {
            bail!("No download with id {id}");
        };
        let url = Url::parse(&record.remote_url)
            .with_context(|| format!("Invalid URL in record for {id}"))?;
        let item = DownloadItem::new(&record.id, &record.title, url);

        service
            .delete(&item)
            .await
            .with_context(|| format!("Failed to delete {id}"))?;
        println!("{TRASH}Deleted {}", id.cyan());
    }
    Ok(())
}

/// Download every URL, rendering combined progress. Returns (finished, failed).
async fn download(
    service: &DownloadService,
    urls: &[String],
    quiet: bool,
) -> Result<(usize, usize)> {
    if urls.is_empty() {
        return Ok((0, 0));
    }

    let mut events = service.subscribe();
    let aggregated = service.aggregated_events();
    tokio::pin!(aggregated);

    let mut pending = HashSet::new();
    for raw in urls {
        let item = item_for_url(raw)?;
        service
            .download(&item, Metadata::new())
            .with_context(|| format!("Failed to queue {raw}"))?;
        pending.insert(item.id);
    }

    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(1000)
    };
    bar.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{DOWNLOAD}[{{bar:40.cyan/blue}}] {{percent:>3}}% {{wide_msg}}"
            ))
            .context("Invalid progress template")?
            .progress_chars("█▓░"),
    );

    let (mut finished, mut failed) = (0, 0);
    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    TransferEvent::Finished(job) => {
                        finished += 1;
                        bar.println(format!("{SUCCESS}{}", job.title.green()));
                    }
                    TransferEvent::Error { job, cause } => {
                        failed += 1;
                        bar.println(format!(
                            "{FAILURE}{} - {}",
                            job.title.red(),
                            cause.to_string().dimmed()
                        ));
                    }
                    _ => continue,
                }
                pending.remove(event.job_id());
            }
            Some(snapshot) = aggregated.next() => {
                bar.set_position((snapshot.combined_fraction_complete * 1000.0).round() as u64);
                bar.set_message(format!("{} active", snapshot.items.len()));
            }
        }
    }

    bar.finish_and_clear();
    Ok((finished, failed))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let options = load_options(&args)?;

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            PACKAGE,
            "podqueue".bold().magenta(),
            "- Background Downloader".dimmed()
        );
    }

    let service =
        DownloadService::with_directory(ReqwestTransport::new().shared(), &args.output_dir, options);

    if args.delete_all {
        service
            .delete_all()
            .await
            .context("Failed to delete downloads")?;
        println!("{TRASH}Deleted {}", args.output_dir.display());
        return Ok(());
    }

    if !args.delete.is_empty() {
        delete(&service, &args.delete).await?;
    }

    let (finished, failed) = download(&service, &args.urls, args.quiet).await?;
    if !args.quiet && !args.urls.is_empty() {
        println!(
            "\n{} {} downloaded, {} failed",
            "Done:".bold().green(),
            finished.to_string().green().bold(),
            if failed > 0 {
                failed.to_string().red().bold()
            } else {
                failed.to_string().green()
            }
        );
    }

    if args.list {
        list(&service).await?;
    }

    if args.size {
        let size = service.refresh_size().await;
        println!("{FOLDER}{} {}", "Size:".bold(), format_bytes(size).cyan());
    }

    service.shutdown().await;

    if failed > 0 && finished == 0 {
        std::process::exit(1);
    }
    Ok(())
}
