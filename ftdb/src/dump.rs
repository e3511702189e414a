use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::client::{fetch_ok, Fetch, FtdbClient};
use crate::types::{value_to_string, ArticleNumbers, Dump, Kit, Part, Ticket};
use crate::{DUMP_FILE, EXCLUDED_CATEGORY, FTDB_URL, KIT_CATEGORY};

fn listing_url() -> String {
    format!("{}/api/tickets?drill_ft_cat_all={}", FTDB_URL, KIT_CATEGORY)
}

fn ticket_api_url(id: u64) -> String {
    format!("{}/api/ticket/{}", FTDB_URL, id)
}

fn partslist_url(id: u64) -> String {
    format!("{}/api/ft-partslist/{}", FTDB_URL, id)
}

/// Ticket ids arrive as numbers or numeric strings
fn parse_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn page_count(dct: &Value, key: &str) -> u64 {
    dct.get(key).and_then(parse_id).unwrap_or(0)
}

/// True if the result's `ft_cat_all` lists the given category
fn has_category(dct: &Value, category: &str) -> bool {
    match dct.get("ft_cat_all") {
        Some(Value::String(s)) => s
            .split(|c: char| !c.is_ascii_digit())
            .any(|token| token == category),
        Some(Value::Array(items)) => items.iter().any(|v| value_to_string(v) == category),
        Some(Value::Number(n)) => n.to_string() == category,
        _ => false,
    }
}

/// Decode `ft_article_nos`, a JSON-encoded list of `[year, article_no]` pairs
fn parse_article_nos(dct: &Value) -> Result<ArticleNumbers> {
    let pairs: Vec<Vec<Value>> = match dct.get("ft_article_nos") {
        None | Some(Value::Null) => return Ok(ArticleNumbers::new()),
        Some(Value::String(s)) if s.trim().is_empty() || s.trim() == "[]" => {
            return Ok(ArticleNumbers::new())
        }
        Some(Value::String(s)) => serde_json::from_str(s)
            .with_context(|| format!("Invalid ft_article_nos: {}", s))?,
        Some(other) => serde_json::from_value(other.clone())
            .with_context(|| format!("Invalid ft_article_nos: {}", other))?,
    };

    Ok(pairs
        .iter()
        .filter_map(|pair| match pair.as_slice() {
            [year, artno] => Some((value_to_string(year), value_to_string(artno))),
            _ => None,
        })
        .collect())
}

fn required_str<'a>(dct: &'a Value, key: &str) -> Result<&'a str> {
    dct.get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("Missing \"{}\" in result", key))
}

/// Fields shared by kits and parts
fn parse_common(dct: &Value) -> Result<Ticket> {
    let id = dct
        .get("ticket_id")
        .and_then(parse_id)
        .context("Missing or invalid \"ticket_id\" in result")?;

    let url_api = ticket_api_url(id);
    let url = url_api.replace("/api", "");

    let thumbnail_url = dct
        .get("ft_icon")
        .and_then(Value::as_str)
        .filter(|icon| !icon.is_empty())
        .map(|icon| format!("{}/thumbnail/{}", FTDB_URL, icon));

    Ok(Ticket {
        id,
        created: required_str(dct, "createdUTC")?.replace(' ', "T"),
        title: required_str(dct, "title")?.to_string(),
        article_numbers: parse_article_nos(dct)?,
        uuid: dct
            .get("ft_variant_uuid")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        url_api,
        url,
        thumbnail_url,
    })
}

/// Ticket ids of a listing page, omitting fischertip kits
pub fn parse_construction_kit_ids(dct: &Value) -> Vec<u64> {
    let Some(results) = dct.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };
    results
        .iter()
        .filter(|d| !has_category(d, EXCLUDED_CATEGORY))
        .filter_map(|d| d.get("ticket_id").and_then(parse_id))
        .collect()
}

/// Parts of a parts-list page with their kit-specific count
pub fn parse_parts(dct: &Value) -> Vec<(Part, Option<u32>)> {
    let Some(results) = dct.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut parts = Vec::with_capacity(results.len());
    for d in results {
        let ticket = match parse_common(d) {
            Ok(t) => t,
            Err(e) => {
                warn!("Skipping part: {:#}", e);
                continue;
            }
        };
        let count = d
            .get("ft_count")
            .map(value_to_string)
            .and_then(|c| c.trim().parse::<u32>().ok());
        let weight = d.get("ft_weight").filter(|w| !w.is_null()).cloned();
        parts.push((Part { ticket, weight }, count));
    }
    parts
}

pub fn get_construction_kit(fetcher: &dyn Fetch, ticket_id: u64) -> Result<Kit> {
    let dct = fetch_ok(fetcher, &ticket_api_url(ticket_id))?;
    let results = dct
        .get("results")
        .with_context(|| format!("Missing results for kit {}", ticket_id))?;
    Ok(Kit {
        ticket: parse_common(results)?,
        parts: BTreeMap::new(),
    })
}

/// Fetch every page of a kit's part list. Failed pages after the first are skipped.
fn get_kit_parts(fetcher: &dyn Fetch, ticket_id: u64) -> Result<Vec<(Part, Option<u32>)>> {
    let base = partslist_url(ticket_id);
    let first = fetch_ok(fetcher, &base)?;
    if page_count(&first, "cTotal") == 0 {
        return Ok(Vec::new());
    }

    let mut parts = Vec::new();
    for page in 1..=page_count(&first, "cPages") {
        match fetch_ok(fetcher, &format!("{}?page={}", base, page)) {
            Ok(dct) => parts.extend(parse_parts(&dct)),
            Err(e) => warn!(kit = ticket_id, page, "Skipping parts page: {:#}", e),
        }
    }
    Ok(parts)
}

/// Download all construction kits of the kit category together with their parts
pub fn download_construction_kits(fetcher: &dyn Fetch) -> Result<Dump> {
    let url = listing_url();
    let first = fetch_ok(fetcher, &url).context("Failed to fetch kit listing")?;
    let pages = page_count(&first, "cPages");
    info!(pages, "Fetching kit listing");

    let mut dump = Dump::default();

    for page in 1..=pages {
        let dct = match fetch_ok(fetcher, &format!("{}&page={}", url, page)) {
            Ok(d) => d,
            Err(e) => {
                warn!(page, "Skipping listing page: {:#}", e);
                continue;
            }
        };
        for ticket_id in parse_construction_kit_ids(&dct) {
            let key = ticket_id.to_string();
            if dump.kits.contains_key(&key) {
                continue;
            }
            match get_construction_kit(fetcher, ticket_id) {
                Ok(kit) => {
                    debug!(kit = ticket_id, title = %kit.ticket.title, "Fetched kit");
                    dump.kits.insert(key, kit);
                }
                Err(e) => warn!(kit = ticket_id, "Skipping kit: {:#}", e),
            }
        }
    }
    info!(kits = dump.kits.len(), "Fetched kits, fetching part lists");

    for kit in dump.kits.values_mut() {
        let ticket_id = kit.ticket.id;
        let parts = match get_kit_parts(fetcher, ticket_id) {
            Ok(p) => p,
            Err(e) => {
                warn!(kit = ticket_id, "Skipping part list: {:#}", e);
                continue;
            }
        };
        for (part, count) in parts {
            let part_id = part.ticket.id.to_string();
            kit.parts.insert(part_id.clone(), count);
            dump.parts.insert(part_id, part);
        }
    }
    info!(kits = dump.kits.len(), parts = dump.parts.len(), "Dump complete");

    Ok(dump)
}

/// Write `ftdb-dump-<date>.json` into `dir` and point `ftdb-dump.json` at it
pub fn write_dump(dump: &Dump, dir: &Path, date: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let filename = format!("ftdb-dump-{}.json", date);
    let path = dir.join(&filename);
    // Going through Value sorts the keys of every nested object
    let json = serde_json::to_string_pretty(&serde_json::to_value(dump)?)?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;

    let link_path = dir.join(DUMP_FILE);
    if link_path.exists() || link_path.is_symlink() {
        fs::remove_file(&link_path)
            .with_context(|| format!("Failed to replace {}", link_path.display()))?;
    }
    #[cfg(unix)]
    symlink(&filename, &link_path)
        .with_context(|| format!("Failed to link {}", link_path.display()))?;
    #[cfg(not(unix))]
    fs::copy(&path, &link_path)
        .with_context(|| format!("Failed to copy to {}", link_path.display()))?;

    Ok(path)
}

/// Read the dump every later stage starts from
pub fn load_dump(path: &Path) -> Result<Dump> {
    let content = fs::read_to_string(path).with_context(|| {
        format!("Failed to read {}. Run `ftdb dump` first.", path.display())
    })?;
    serde_json::from_str(&content).with_context(|| format!("Malformed dump: {}", path.display()))
}

pub fn run_dump(output_dir: &Path) -> Result<()> {
    let client = FtdbClient::new()?;
    let dump = download_construction_kits(&client)?;
    let date = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();
    let path = write_dump(&dump, output_dir, &date)?;
    info!(path = %path.display(), "Wrote dump");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeFtdb;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn kit_detail(id: u64, title: &str) -> Value {
        json!({
            "status": "OK",
            "results": {
                "ticket_id": id,
                "createdUTC": "2019-03-02 10:11:12",
                "title": title,
                "ft_article_nos": "[[\"1985\", \"30515\"], [null, \"30515-2\"]]",
                "ft_variant_uuid": "c0ffee",
                "ft_icon": format!("icon-{}", id),
            }
        })
    }

    fn part_result(id: u64, title: &str, count: &str) -> Value {
        json!({
            "ticket_id": id.to_string(),
            "createdUTC": "2018-01-01 00:00:00",
            "title": title,
            "ft_article_nos": "[]",
            "ft_weight": "1.5",
            "ft_count": count,
        })
    }

    fn fake_service() -> FakeFtdb {
        let listing = listing_url();
        FakeFtdb::default()
            .with_json(&listing, json!({"status": "OK", "cPages": 2, "results": []}))
            .with_json(
                &format!("{}&page=1", listing),
                json!({"status": "OK", "results": [
                    {"ticket_id": 10, "ft_cat_all": "653,700"},
                    {"ticket_id": 11, "ft_cat_all": "653,661"},
                    {"ticket_id": 12, "ft_cat_all": ["653"]},
                ]}),
            )
            .with_json(
                &format!("{}&page=2", listing),
                json!({"status": "OK", "results": [
                    {"ticket_id": "12", "ft_cat_all": "653"},
                    {"ticket_id": 13, "ft_cat_all": ["653", "661"]},
                    {"ticket_id": 14, "ft_cat_all": "653"},
                ]}),
            )
            .with_json(&ticket_api_url(10), kit_detail(10, "Hobby 1"))
            .with_json(&ticket_api_url(12), kit_detail(12, "Statik"))
            .with_json(&ticket_api_url(14), json!({"status": "ERROR"}))
            .with_json(&partslist_url(10), json!({"status": "OK", "cTotal": 3, "cPages": 2}))
            .with_json(
                &format!("{}?page=1", partslist_url(10)),
                json!({"status": "OK", "results": [
                    part_result(500, "Baustein 30", "12"),
                    part_result(501, "Achse 60", ""),
                ]}),
            )
            .with_json(
                &format!("{}?page=2", partslist_url(10)),
                json!({"status": "OK", "results": [part_result(502, "Winkelstein", "4")]}),
            )
            .with_json(&partslist_url(12), json!({"status": "OK", "cTotal": 0, "cPages": 0}))
    }

    #[test]
    fn test_excluded_category_and_duplicates() {
        let fake = fake_service();
        let dump = download_construction_kits(&fake).unwrap();

        // 11 and 13 are fischertip, 14 fails, 12 is listed twice
        let ids: Vec<&String> = dump.kits.keys().collect();
        assert_eq!(ids, vec!["10", "12"]);
        assert_eq!(dump.kits["10"].ticket.id, 10);

        // Kit 12 detail is fetched only once
        let detail_fetches = fake
            .requests
            .borrow()
            .iter()
            .filter(|u| **u == ticket_api_url(12))
            .count();
        assert_eq!(detail_fetches, 1);
    }

    #[test]
    fn test_parts_are_collected_with_counts() {
        let dump = download_construction_kits(&fake_service()).unwrap();

        let hobby = &dump.kits["10"];
        assert_eq!(hobby.parts.get("500"), Some(&Some(12)));
        assert_eq!(hobby.parts.get("501"), Some(&None));
        assert_eq!(hobby.parts.get("502"), Some(&Some(4)));
        assert!(dump.kits["12"].parts.is_empty());

        assert_eq!(dump.parts.len(), 3);
        assert_eq!(dump.parts["500"].weight, Some(json!("1.5")));
        assert_eq!(dump.parts["501"].ticket.thumbnail_url, None);
    }

    #[test]
    fn test_common_fields() {
        let dump = download_construction_kits(&fake_service()).unwrap();
        let kit = &dump.kits["10"].ticket;

        assert_eq!(kit.created, "2019-03-02T10:11:12");
        assert_eq!(kit.url_api, "https://ft-datenbank.de/api/ticket/10");
        assert_eq!(kit.url, "https://ft-datenbank.de/ticket/10");
        assert_eq!(
            kit.thumbnail_url.as_deref(),
            Some("https://ft-datenbank.de/thumbnail/icon-10")
        );
        assert_eq!(kit.uuid.as_deref(), Some("c0ffee"));
        assert_eq!(kit.article_numbers.get("1985").map(String::as_str), Some("30515"));
        assert_eq!(kit.article_numbers.get("").map(String::as_str), Some("30515-2"));
    }

    #[test]
    fn test_listing_failure_is_fatal() {
        let fake = FakeFtdb::default();
        assert!(download_construction_kits(&fake).is_err());
    }

    #[test]
    fn test_has_category_matches_whole_codes() {
        assert!(has_category(&json!({"ft_cat_all": "653,661"}), "661"));
        assert!(has_category(&json!({"ft_cat_all": [653, 661]}), "661"));
        assert!(!has_category(&json!({"ft_cat_all": "653,6610"}), "661"));
        assert!(!has_category(&json!({}), "661"));
    }

    #[test]
    fn test_write_and_reload_dump() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = download_construction_kits(&fake_service()).unwrap();

        let path = write_dump(&dump, tmp.path(), "2020-05-01").unwrap();
        assert_eq!(path, tmp.path().join("ftdb-dump-2020-05-01.json"));

        // Writing again replaces the link instead of failing
        write_dump(&dump, tmp.path(), "2020-05-02").unwrap();

        let reloaded = load_dump(&tmp.path().join(DUMP_FILE)).unwrap();
        assert_eq!(reloaded, dump);

        let ids: BTreeSet<u64> = reloaded.kits.values().map(|k| k.ticket.id).collect();
        assert_eq!(ids, BTreeSet::from([10, 12]));
    }

    #[test]
    fn test_dump_keys_are_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = download_construction_kits(&fake_service()).unwrap();
        let path = write_dump(&dump, tmp.path(), "2020-05-01").unwrap();
        let text = fs::read_to_string(path).unwrap();

        // Keys of the first kit object, at three levels of indentation
        let keys: Vec<&str> = text
            .lines()
            .skip_while(|l| !l.starts_with("    \"10\": {"))
            .skip(1)
            .take_while(|l| !l.starts_with("    }"))
            .filter(|l| l.starts_with("      \""))
            .filter_map(|l| l.trim().split('"').nth(1))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();

        assert_eq!(keys.len(), 9);
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_write_dump_reports_bad_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("not-a-dir");
        fs::write(&file, "x").unwrap();
        let err = write_dump(&Dump::default(), &file, "2020-05-01").unwrap_err();
        assert!(err.to_string().contains("not-a-dir"));
    }

    #[test]
    fn test_load_dump_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = load_dump(&tmp.path().join(DUMP_FILE)).unwrap_err();
        assert!(missing.to_string().contains("ftdb dump"));

        let broken = tmp.path().join("broken.json");
        fs::write(&broken, "{\"kits\": ").unwrap();
        assert!(load_dump(&broken).is_err());
    }
}
