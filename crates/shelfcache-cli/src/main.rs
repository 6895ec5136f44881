//! shelfcache - inspect and maintain the metadata cache from the shell.
//!
//! Logs go to stderr; command output goes to stdout so it can be piped.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use shelfcache::{CacheSettings, SearchHit, ShelfCache, DEFAULT_SEARCH_LIMIT};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "shelfcache")]
#[command(about = "Inspect and maintain the audiobook metadata cache")]
struct Args {
    /// JSON settings file (defaults apply when absent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage file, overriding settings and CACHE_DB_PATH
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print cache statistics as JSON
    Stats,
    /// Delete expired entries
    Cleanup,
    /// Remove entries
    Clear(ClearArgs),
    /// Full-text search over titles and authors
    Search {
        query: String,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// Print one cached value
    Get { namespace: String, key: String },
    /// Invalidate by external id or key pattern
    Invalidate(InvalidateArgs),
    /// Delete the storage file so it is rebuilt on next open
    Reset {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(clap::Args, Debug)]
#[group(required = true, multiple = false)]
struct ClearArgs {
    /// Clear one namespace
    #[arg(long)]
    namespace: Option<String>,
    /// Clear every pricing namespace
    #[arg(long)]
    pricing: bool,
    /// Clear every entry (item mappings are kept)
    #[arg(long)]
    all: bool,
}

#[derive(clap::Args, Debug)]
#[group(required = true, multiple = false)]
struct InvalidateArgs {
    /// Remove every entry linked to this id
    #[arg(long)]
    external_id: Option<String>,
    /// Remove keys of NAMESPACE matching GLOB
    #[arg(long, num_args = 2, value_names = ["NAMESPACE", "GLOB"])]
    pattern: Option<Vec<String>>,
}

/// How a command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    /// The requested entry was not cached.
    Miss,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Set up logging
    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let stdout = std::io::stdout();
    match run(&args, &mut stdout.lock())? {
        Outcome::Done => Ok(ExitCode::SUCCESS),
        Outcome::Miss => Ok(ExitCode::FAILURE),
    }
}

fn load_settings(args: &Args) -> Result<CacheSettings> {
    let mut settings = match &args.config {
        Some(path) => CacheSettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => {
            let mut settings = CacheSettings::default();
            settings.apply_env_overrides()?;
            settings
        }
    };
    if let Some(db_path) = &args.db_path {
        settings.db_path = db_path.clone();
    }
    settings.validate()?;
    debug!("Using cache at {}", settings.db_path.display());
    Ok(settings)
}

fn run(args: &Args, out: &mut impl Write) -> Result<Outcome> {
    let settings = load_settings(args)?;

    if let Command::Reset { yes } = &args.command {
        if !yes {
            bail!("Refusing to delete {} without --yes", settings.db_path.display());
        }
        ShelfCache::reset_storage(&settings.db_path)?;
        info!("Removed cache storage at {}", settings.db_path.display());
        return Ok(Outcome::Done);
    }

    let cache = ShelfCache::open(settings).context("Failed to open cache")?;

    match &args.command {
        Command::Stats => {
            writeln!(out, "{}", serde_json::to_string_pretty(&cache.stats()?)?)?;
        }
        Command::Cleanup => {
            let removed = cache.cleanup_expired()?;
            writeln!(out, "{}", json!({ "removed": removed }))?;
        }
        Command::Clear(clear) => {
            let removed = if let Some(namespace) = &clear.namespace {
                cache.clear_namespace(namespace)?
            } else if clear.pricing {
                cache.clear_pricing()?.total()
            } else {
                cache.clear_all()?
            };
            writeln!(out, "{}", json!({ "removed": removed }))?;
        }
        Command::Search {
            query,
            namespace,
            limit,
        } => {
            let hits: Vec<Value> = cache
                .search_with_limit(query, namespace.as_deref(), *limit)
                .iter()
                .map(hit_to_json)
                .collect();
            writeln!(out, "{}", serde_json::to_string_pretty(&hits)?)?;
        }
        Command::Get { namespace, key } => match cache.get(namespace, key) {
            Some(value) => {
                out.write_all(&value)?;
                writeln!(out)?;
            }
            None => {
                info!("No live entry for {}/{}", namespace, key);
                return Ok(Outcome::Miss);
            }
        },
        Command::Invalidate(invalidate) => {
            let report = if let Some(external_id) = &invalidate.external_id {
                json!(cache.delete_by_external_id(external_id)?)
            } else if let Some([namespace, glob]) = invalidate.pattern.as_deref() {
                json!({ "removed": cache.delete_by_pattern(namespace, glob)? })
            } else {
                bail!("invalidate needs --external-id or --pattern NAMESPACE GLOB");
            };
            writeln!(out, "{}", report)?;
        }
        // Handled before the cache is opened.
        Command::Reset { .. } => {}
    }

    Ok(Outcome::Done)
}

/// Embed JSON payloads as JSON, anything else as lossy text.
fn hit_to_json(hit: &SearchHit) -> Value {
    let value = serde_json::from_slice::<Value>(&hit.value)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&hit.value).into_owned()));
    json!({
        "namespace": hit.namespace,
        "key": hit.key,
        "score": hit.score,
        "created_at": hit.created_at,
        "value": value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfcache::{SearchFields, SetOptions};
    use tempfile::TempDir;

    fn parse(db_path: &std::path::Path, rest: &[&str]) -> Args {
        let mut argv = vec!["shelfcache", "--db-path", db_path.to_str().unwrap()];
        argv.extend_from_slice(rest);
        Args::try_parse_from(argv).unwrap()
    }

    fn seed(db_path: &std::path::Path) {
        let cache = ShelfCache::open(CacheSettings::with_db_path(db_path)).unwrap();
        cache
            .set(
                "catalog",
                "B01",
                br#"{"title":"Dune"}"#.to_vec(),
                &SetOptions::new()
                    .external_id("B01")
                    .searchable(SearchFields::new("Dune").with_author("Frank Herbert")),
            )
            .unwrap();
    }

    fn run_to_string(args: &Args) -> (Outcome, String) {
        let mut out = Vec::new();
        let code = run(args, &mut out).unwrap();
        (code, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_clear_requires_exactly_one_target() {
        assert!(Args::try_parse_from(["shelfcache", "clear"]).is_err());
        assert!(Args::try_parse_from(["shelfcache", "clear", "--all", "--pricing"]).is_err());
        assert!(Args::try_parse_from(["shelfcache", "clear", "--namespace", "catalog"]).is_ok());
    }

    #[test]
    fn test_get_and_search() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("cache.db");
        seed(&db);

        let (code, output) = run_to_string(&parse(&db, &["get", "catalog", "B01"]));
        assert_eq!(code, Outcome::Done);
        assert_eq!(output.trim(), r#"{"title":"Dune"}"#);

        let (code, _) = run_to_string(&parse(&db, &["get", "catalog", "missing"]));
        assert_eq!(code, Outcome::Miss);

        let (_, output) = run_to_string(&parse(&db, &["search", "frank herbert"]));
        let hits: Vec<Value> = serde_json::from_str(&output).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["value"]["title"], "Dune");
    }

    #[test]
    fn test_invalidate_and_stats() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("cache.db");
        seed(&db);

        let (_, output) = run_to_string(&parse(&db, &["invalidate", "--external-id", "B01"]));
        let report: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(report["removed"]["catalog"], 1);

        let (_, output) = run_to_string(&parse(&db, &["stats"]));
        let stats: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(stats["total_entries"], 0);
    }

    #[test]
    fn test_reset_needs_confirmation() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("cache.db");
        seed(&db);

        let mut out = Vec::new();
        assert!(run(&parse(&db, &["reset"]), &mut out).is_err());
        assert!(db.exists());

        let (code, _) = run_to_string(&parse(&db, &["reset", "--yes"]));
        assert_eq!(code, Outcome::Done);
        assert!(!db.exists());
    }
}
