use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use packmule_artifact::{ArtifactSpec, ensure_valid, quarantine};
use packmule_core::{
    EventLog, PackmuleConfig, Reporter, UpdateOptions, check_eligibility, run_update,
};
use packmule_download::{Downloader, HttpDownloader, MockDownloader};
use packmule_manifest::Manifest;
use packmule_manifest_gen::GeneratorInput;
use packmule_store::ReleaseStore;

#[derive(Parser, Debug)]
#[command(name = "packmule", version)]
#[command(about = "Content-addressed differential updater for worker tool releases")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a manifest from a release tree.
    Generate {
        #[arg(long)]
        release_root: PathBuf,
        #[arg(long)]
        tool_id: String,
        #[arg(long)]
        tool_version: String,
        /// Overrides the config file's base URL and the PACKMULE_BASE_URL
        /// environment variable, if given.
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long, value_enum, default_value = "safe")]
        delete_policy: DeletePolicyArg,
        #[arg(long = "ignore-glob")]
        ignore_globs: Vec<String>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Classify a target manifest against a current one.
    Diff {
        /// Omit to diff against no installation (everything downloads).
        #[arg(long)]
        current: Option<PathBuf>,
        #[arg(long)]
        target: PathBuf,
    },
    /// Run the delta-update activation protocol against a release store.
    Update {
        #[arg(long)]
        store_root: PathBuf,
        #[arg(long)]
        target: PathBuf,
        /// Directory of fixture files keyed by URL basename, used instead of
        /// real HTTP fetches. Intended for offline rehearsal and tests.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        #[arg(long, default_value_t = 4)]
        fan_out: usize,
    },
    /// Report whether a store's installed release satisfies a requirement.
    Eligibility {
        #[arg(long)]
        store_root: PathBuf,
        #[arg(long)]
        required_version: String,
        #[arg(long)]
        required_manifest_hash: String,
    },
    /// Large single-file artifact operations (lock, download, quarantine).
    Artifact {
        #[command(subcommand)]
        cmd: ArtifactCommands,
    },
    /// Print configuration, store, and environment diagnostics.
    Doctor {
        #[arg(long)]
        store_root: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ArtifactCommands {
    /// Acquire a valid copy of the artifact, downloading or quarantining and
    /// redownloading as needed.
    Ensure {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        url: String,
        #[arg(long)]
        sha256: Option<String>,
        #[arg(long, default_value_t = 0)]
        min_size: u64,
        /// Expected magic bytes at offset 0, as a hex string (e.g. `47475546`).
        #[arg(long)]
        magic_hex: Option<String>,
        #[arg(long, default_value = "30s")]
        lock_timeout: String,
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Quarantine an artifact unconditionally (rename aside).
    Quarantine {
        #[arg(long)]
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum DeletePolicyArg {
    Safe,
    None,
}

impl From<DeletePolicyArg> for packmule_manifest::DeletePolicy {
    fn from(value: DeletePolicyArg) -> Self {
        match value {
            DeletePolicyArg::Safe => packmule_manifest::DeletePolicy::Safe,
            DeletePolicyArg::None => packmule_manifest::DeletePolicy::None,
        }
    }
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
/// Distinguished exit code for "artifact corruption detected at load time",
/// per spec §4.7 — lets a supervising process tell this apart from an
/// ordinary failure and decide whether to retry immediately.
const EXIT_LOAD_CORRUPT: i32 = 66;

fn main() {
    let cli = Cli::parse();
    let mut reporter = CliReporter;

    let code = match run(cli, &mut reporter) {
        Ok(()) => EXIT_OK,
        Err(err) => {
            reporter.error(&format!("{err:#}"));
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli, reporter: &mut dyn Reporter) -> Result<()> {
    match cli.cmd {
        Commands::Generate {
            release_root,
            tool_id,
            tool_version,
            base_url,
            delete_policy,
            ignore_globs,
            out,
        } => run_generate(
            &release_root,
            &tool_id,
            &tool_version,
            base_url,
            delete_policy.into(),
            ignore_globs,
            &out,
        ),
        Commands::Diff { current, target } => run_diff(current.as_deref(), &target),
        Commands::Update {
            store_root,
            target,
            fixtures,
            fan_out,
        } => run_update_cmd(&store_root, &target, fixtures.as_deref(), fan_out, reporter),
        Commands::Eligibility {
            store_root,
            required_version,
            required_manifest_hash,
        } => run_eligibility(&store_root, &required_version, &required_manifest_hash),
        Commands::Artifact { cmd } => run_artifact(cmd),
        Commands::Doctor { store_root } => run_doctor(store_root.as_deref(), reporter),
    }
}

fn run_generate(
    release_root: &std::path::Path,
    tool_id: &str,
    tool_version: &str,
    base_url_override: Option<String>,
    delete_policy: packmule_manifest::DeletePolicy,
    ignore_globs: Vec<String>,
    out: &std::path::Path,
) -> Result<()> {
    let config = PackmuleConfig::load_from_dir(release_root)?;
    let base_url = base_url_override.unwrap_or_else(|| config.resolved_base_url());

    let manifest = packmule_manifest_gen::generate(&GeneratorInput {
        release_root,
        tool_id,
        tool_version,
        base_url: &base_url,
        delete_policy,
        extra_ignore_globs: ignore_globs,
    })?;

    manifest.save(out)?;
    println!("wrote manifest for {tool_id} v{tool_version} to {}", out.display());
    println!("manifest_hash: {}", manifest.manifest_hash);
    println!("files: {}", manifest.files.len());

    Ok(())
}

fn run_diff(current: Option<&std::path::Path>, target: &std::path::Path) -> Result<()> {
    let current_manifest = current.map(Manifest::load).transpose()?;
    let target_manifest = Manifest::load(target)?;

    let entries = packmule_manifest::diff(current_manifest.as_ref(), &target_manifest);
    let mut downloads = 0;
    let mut skips = 0;
    let mut deletes = 0;

    for entry in &entries {
        match entry {
            packmule_manifest::DiffEntry::Skip(_) => {
                skips += 1;
                println!("skip      {}", entry.path());
            }
            packmule_manifest::DiffEntry::Download(_) => {
                downloads += 1;
                println!("download  {}", entry.path());
            }
            packmule_manifest::DiffEntry::Delete { .. } => {
                deletes += 1;
                println!("delete    {}", entry.path());
            }
        }
    }

    println!();
    println!("{downloads} to download, {skips} to carry over, {deletes} to delete");

    Ok(())
}

fn run_update_cmd(
    store_root: &std::path::Path,
    target_path: &std::path::Path,
    fixtures: Option<&std::path::Path>,
    fan_out: usize,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let store = ReleaseStore::new(store_root);
    let target = Manifest::load(target_path)?;
    let current = store.current_manifest()?;

    let downloader: Box<dyn Downloader> = match fixtures {
        Some(dir) => Box::new(MockDownloader::new(dir)),
        None => Box::new(HttpDownloader::new()?),
    };

    let events_path = packmule_core::events::events_path(store_root);
    let mut events = EventLog::read_from_file(&events_path)?;

    let stats = run_update(
        &store,
        current.as_ref(),
        &target,
        downloader.as_ref(),
        &UpdateOptions { fan_out },
        &mut events,
        reporter,
    )?;

    events.write_to_file(&events_path)?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn run_eligibility(
    store_root: &std::path::Path,
    required_version: &str,
    required_manifest_hash: &str,
) -> Result<()> {
    let store = ReleaseStore::new(store_root);
    let report = check_eligibility(&store, required_version, required_manifest_hash)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_artifact(cmd: ArtifactCommands) -> Result<()> {
    match cmd {
        ArtifactCommands::Ensure {
            path,
            url,
            sha256,
            min_size,
            magic_hex,
            lock_timeout,
            fixtures,
        } => {
            let magic = magic_hex
                .map(|hex_str| {
                    hex::decode(&hex_str).with_context(|| format!("invalid --magic-hex {hex_str:?}"))
                })
                .transpose()?;
            let lock_timeout = humantime::parse_duration(&lock_timeout)
                .with_context(|| format!("invalid --lock-timeout {lock_timeout:?}"))?;

            let spec = ArtifactSpec {
                path,
                url,
                expected_sha256: sha256,
                min_size,
                magic,
                lock_timeout,
            };

            let downloader: Box<dyn Downloader> = match fixtures {
                Some(dir) => Box::new(MockDownloader::new(dir)),
                None => Box::new(HttpDownloader::new()?),
            };

            let state = match ensure_valid(&spec, downloader.as_ref()) {
                Ok(state) => state,
                Err(err @ packmule_artifact::ArtifactError::BadHeader { .. })
                | Err(err @ packmule_artifact::ArtifactError::SizeMismatch { .. }) => {
                    // Still corrupt after a fresh download: this is the
                    // consumer-visible "bad artifact" outcome, not a
                    // transient network or lock problem.
                    eprintln!("[error] {err}");
                    std::process::exit(EXIT_LOAD_CORRUPT);
                }
                Err(err) => bail!(err),
            };
            println!("{state:?}");
            Ok(())
        }
        ArtifactCommands::Quarantine { path } => {
            quarantine(&path)?;
            println!("quarantined {}", path.display());
            Ok(())
        }
    }
}

fn run_doctor(store_root: Option<&std::path::Path>, reporter: &mut dyn Reporter) -> Result<()> {
    let config_dir = store_root.unwrap_or_else(|| std::path::Path::new("."));
    let config = PackmuleConfig::load_from_dir(config_dir)?;

    println!("base_url: {}", config.resolved_base_url());
    println!("lock_timeout: {:?}", config.lock.timeout);
    println!("network.connect_timeout: {:?}", config.network.connect_timeout);
    println!("parallel.fan_out: {}", config.parallel.fan_out);
    println!("retry.policy: {:?}", config.retry.policy);
    println!();

    match store_root {
        Some(root) => {
            let store = ReleaseStore::new(root);
            match store.current_manifest() {
                Ok(Some(manifest)) => {
                    println!(
                        "current: {} v{} (manifest_hash {})",
                        manifest.tool_id, manifest.tool_version, manifest.manifest_hash
                    );
                }
                Ok(None) => println!("current: (nothing installed)"),
                Err(err) => reporter.warn(&format!("failed to read current release: {err:#}")),
            }
        }
        None => println!("current: (no --store-root given)"),
    }

    print_network_reachability(&config.resolved_base_url(), reporter);

    Ok(())
}

/// Best-effort reachability probe: never fails `doctor`, only warns.
fn print_network_reachability(base_url: &str, reporter: &mut dyn Reporter) {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            reporter.warn(&format!("failed to build HTTP client: {err}"));
            return;
        }
    };

    match client.head(base_url).send() {
        Ok(response) => println!("base_url reachable: status {}", response.status()),
        Err(err) => reporter.warn(&format!("base_url unreachable: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_policy_arg_converts_to_manifest_delete_policy() {
        assert_eq!(
            packmule_manifest::DeletePolicy::from(DeletePolicyArg::Safe),
            packmule_manifest::DeletePolicy::Safe
        );
        assert_eq!(
            packmule_manifest::DeletePolicy::from(DeletePolicyArg::None),
            packmule_manifest::DeletePolicy::None
        );
    }

    #[test]
    fn cli_parses_generate_subcommand() {
        let cli = Cli::parse_from([
            "packmule",
            "generate",
            "--release-root",
            "/tmp/release",
            "--tool-id",
            "demo",
            "--tool-version",
            "1.0.0",
            "--out",
            "/tmp/manifest.json",
        ]);
        assert!(matches!(cli.cmd, Commands::Generate { .. }));
    }

    #[test]
    fn cli_parses_artifact_ensure_subcommand() {
        let cli = Cli::parse_from([
            "packmule",
            "artifact",
            "ensure",
            "--path",
            "/tmp/model.gguf",
            "--url",
            "https://updates.example.test/model.gguf",
        ]);
        assert!(matches!(
            cli.cmd,
            Commands::Artifact {
                cmd: ArtifactCommands::Ensure { .. }
            }
        ));
    }
}
