use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::types::Domain;
use serde::Serialize;

/// Inspect or seed a kernelsprite record store. The bot must be stopped:
/// the store is single-writer.
#[derive(Parser, Debug)]
#[command(name = "ksctl", version)]
struct Cli {
    /// Path to the sled database (the bot's first argument).
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Entry counts, parked items and cursors, as JSON.
    Stats,
    /// Every settled key and its marker.
    List { domain: Domain },
    /// Record an item as handled so the bot never acts on it.
    Settle {
        domain: Domain,
        key: String,
        marker: String,
    },
    /// Show a domain's cursor.
    Cursor { domain: Domain },
}

#[derive(Serialize, Debug, PartialEq)]
struct CollectionStats {
    domain: Domain,
    entries: usize,
    /// Items waiting for another action attempt.
    parked: usize,
    cursor: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let db = sled::open(&cli.db)
        .with_context(|| format!("opening sled db at {} (is the bot running?)", cli.db.display()))?;

    match cli.command {
        Command::Stats => {
            let stats = stats(&db)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::List { domain } => {
            for (key, marker) in list(&db, domain)? {
                println!("{key}\t{marker}");
            }
        }
        Command::Settle {
            domain,
            key,
            marker,
        } => {
            if settle(&db, domain, &key, &marker)? {
                println!("✔ settled {key} in {domain}");
            } else {
                eprintln!("Warning: {key} was already settled in {domain}, left untouched");
            }
        }
        Command::Cursor { domain } => match cursor(&db, domain)? {
            Some(cursor) => println!("{cursor}"),
            None => eprintln!("no cursor for {domain}"),
        },
    }

    db.flush()?;
    Ok(())
}

fn stats(db: &sled::Db) -> Result<Vec<CollectionStats>> {
    Domain::ALL
        .into_iter()
        .map(|domain| -> Result<CollectionStats> {
            let tree = db
                .open_tree(domain.collection())
                .with_context(|| format!("opening collection '{domain}'"))?;
            Ok(CollectionStats {
                domain,
                entries: tree.len(),
                parked: db.scan_prefix(domain.retry_prefix()).count(),
                cursor: cursor(db, domain)?,
            })
        })
        .collect()
}

fn list(db: &sled::Db, domain: Domain) -> Result<Vec<(String, String)>> {
    let tree = db
        .open_tree(domain.collection())
        .with_context(|| format!("opening collection '{domain}'"))?;

    tree.iter()
        .map(|entry| -> Result<(String, String)> {
            let (key, marker) = entry.context("reading entry")?;
            Ok((
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&marker).into_owned(),
            ))
        })
        .collect()
}

fn settle(db: &sled::Db, domain: Domain, key: &str, marker: &str) -> Result<bool> {
    let tree = db
        .open_tree(domain.collection())
        .with_context(|| format!("opening collection '{domain}'"))?;

    let swapped = tree
        .compare_and_swap(key, None::<&[u8]>, Some(marker.as_bytes()))
        .context("writing entry")?;
    Ok(swapped.is_ok())
}

fn cursor(db: &sled::Db, domain: Domain) -> Result<Option<String>> {
    let value = db
        .get(domain.cursor_key())
        .with_context(|| format!("reading cursor for '{domain}'"))?;
    Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    #[test]
    fn settle_then_list() {
        let db = temp_db();

        assert!(settle(&db, Domain::Followers, "https://a.example/@jade", "2").unwrap());
        assert!(!settle(&db, Domain::Followers, "https://a.example/@jade", "3").unwrap());

        assert_eq!(
            list(&db, Domain::Followers).unwrap(),
            vec![("https://a.example/@jade".to_string(), "2".to_string())]
        );
        assert!(list(&db, Domain::Posts).unwrap().is_empty());
    }

    #[test]
    fn stats_reports_both_collections() {
        let db = temp_db();
        settle(&db, Domain::Posts, "https://a.example/@x/1", "1").unwrap();
        db.insert(Domain::Posts.cursor_key(), "1").unwrap();
        db.insert(format!("{}2", Domain::Posts.retry_prefix()), "parked").unwrap();

        assert_eq!(
            stats(&db).unwrap(),
            vec![
                CollectionStats {
                    domain: Domain::Posts,
                    entries: 1,
                    parked: 1,
                    cursor: Some("1".into()),
                },
                CollectionStats {
                    domain: Domain::Followers,
                    entries: 0,
                    parked: 0,
                    cursor: None,
                },
            ]
        );
    }

    #[test]
    fn cli_parses_domains() {
        let cli = Cli::try_parse_from(["ksctl", "ks.db", "list", "followers"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::List {
                domain: Domain::Followers
            }
        ));

        assert!(Cli::try_parse_from(["ksctl", "ks.db", "list", "boosts"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
