/// Versioned config-shape migration.
///
/// [`migrate`] is a pure transform over the parsed TOML table, applied before
/// deserialization so the rest of the daemon only ever sees the current shape.
/// Steps run in order for every version the file is older than:
///
///   < 2.0.0  legacy `blitz_path` / `apps` layouts become `app_groups`;
///            a `[monitoring]` table is added if missing.
///   < 3.0.0  every group gets `enabled`, `condition` and array-typed app lists.
///   < 4.0.0  every controlled app gets `path` and `action`.
///
/// Keys the migration does not know about are left untouched.
use std::cmp::Ordering;

use toml::{Table, Value};
use tracing::{debug, info};

use crate::config::DEFAULT_INTERVAL_MS;

pub const CURRENT_CONFIG_VERSION: &str = "4.0.0";
const UNVERSIONED: &str = "1.0.0";

const LEGACY_GROUP_NAME: &str = "League of Legends";
const LEGACY_MONITORED: &[&str] = &["LeagueClient.exe", "League of Legends.exe"];
const LEGACY_CONTROLLED: &str = "Blitz.exe";

/// Compares dotted numeric versions; missing or non-numeric parts count as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Brings `config` up to [`CURRENT_CONFIG_VERSION`].
pub fn migrate(mut config: Table) -> Table {
    let from = config
        .get("config_version")
        .and_then(Value::as_str)
        .unwrap_or(UNVERSIONED)
        .to_string();

    if compare_versions(&from, CURRENT_CONFIG_VERSION) != Ordering::Less {
        debug!(version = %from, "Config is current");
        return config;
    }

    info!(from = %from, to = CURRENT_CONFIG_VERSION, "Migrating config");

    if compare_versions(&from, "2.0.0") == Ordering::Less {
        to_v2(&mut config);
    }
    if compare_versions(&from, "3.0.0") == Ordering::Less {
        to_v3(&mut config);
    }
    to_v4(&mut config);

    config.insert(
        "config_version".into(),
        Value::String(CURRENT_CONFIG_VERSION.into()),
    );
    config
}

fn to_v2(config: &mut Table) {
    // The very first release watched League and controlled Blitz only.
    if let Some(Value::String(path)) = config.remove("blitz_path") {
        if !config.contains_key("app_groups") && !config.contains_key("apps") {
            config.insert("app_groups".into(), Value::Array(vec![legacy_group(path)]));
        }
    }

    if let Some(Value::Array(apps)) = config.remove("apps") {
        let groups = apps
            .into_iter()
            .filter_map(|app| match app {
                Value::Table(app) => Some(Value::Table(group_from_app(app))),
                _ => None,
            })
            .collect();
        config.insert("app_groups".into(), Value::Array(groups));
    }

    if !config.contains_key("monitoring") {
        let mut monitoring = Table::new();
        monitoring.insert("interval".into(), Value::Integer(DEFAULT_INTERVAL_MS as i64));
        monitoring.insert("enabled".into(), Value::Boolean(true));
        config.insert("monitoring".into(), Value::Table(monitoring));
    }
}

fn legacy_group(blitz_path: String) -> Value {
    let monitored = LEGACY_MONITORED
        .iter()
        .map(|name| {
            let mut app = Table::new();
            app.insert("name".into(), Value::String((*name).into()));
            Value::Table(app)
        })
        .collect();

    let mut controlled = Table::new();
    controlled.insert("name".into(), Value::String(LEGACY_CONTROLLED.into()));
    controlled.insert("path".into(), Value::String(blitz_path));
    controlled.insert("action".into(), Value::String("sync".into()));

    let mut group = Table::new();
    group.insert("name".into(), Value::String(LEGACY_GROUP_NAME.into()));
    group.insert("enabled".into(), Value::Boolean(true));
    group.insert("condition".into(), Value::String("any".into()));
    group.insert("monitored_apps".into(), Value::Array(monitored));
    group.insert(
        "controlled_apps".into(),
        Value::Array(vec![Value::Table(controlled)]),
    );
    Value::Table(group)
}

fn group_from_app(mut app: Table) -> Table {
    let name = match app.remove("name") {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => "Migrated Group".to_string(),
    };
    let enabled = !matches!(app.get("enabled"), Some(Value::Boolean(false)));

    let mut group = Table::new();
    group.insert("name".into(), Value::String(name));
    group.insert("enabled".into(), Value::Boolean(enabled));
    group.insert("condition".into(), Value::String("any".into()));
    for key in ["monitored_apps", "controlled_apps"] {
        let list = app
            .remove(key)
            .filter(Value::is_array)
            .unwrap_or_else(|| Value::Array(Vec::new()));
        group.insert(key.into(), list);
    }
    group
}

fn to_v3(config: &mut Table) {
    for group in groups_mut(config) {
        let enabled = !matches!(group.get("enabled"), Some(Value::Boolean(false)));
        group.insert("enabled".into(), Value::Boolean(enabled));
        if !group.get("condition").is_some_and(Value::is_str) {
            group.insert("condition".into(), Value::String("any".into()));
        }
        for key in ["monitored_apps", "controlled_apps"] {
            if !group.get(key).is_some_and(Value::is_array) {
                group.insert(key.into(), Value::Array(Vec::new()));
            }
        }
    }
}

fn to_v4(config: &mut Table) {
    for group in groups_mut(config) {
        let Some(Value::Array(apps)) = group.get_mut("controlled_apps") else {
            continue;
        };
        for app in apps.iter_mut().filter_map(Value::as_table_mut) {
            if !app.get("path").is_some_and(Value::is_str) {
                app.insert("path".into(), Value::String(String::new()));
            }
            if !app.get("action").is_some_and(Value::is_str) {
                app.insert("action".into(), Value::String("sync".into()));
            }
        }
    }
}

fn groups_mut(config: &mut Table) -> impl Iterator<Item = &mut Table> {
    config
        .get_mut("app_groups")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flat_map(|groups| groups.iter_mut().filter_map(Value::as_table_mut))
}
