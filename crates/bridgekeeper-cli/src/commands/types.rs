use super::{json_pretty, or_dash, EXIT_SUCCESS};
use bridgekeeper_core::CoreConfig;
use bridgekeeper_store::{StoreLayout, TypeStore};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct TypeRow {
    #[serde(rename = "type")]
    type_id: String,
    installed: Option<String>,
    staged: Option<String>,
    #[serde(rename = "updateAvailable")]
    update_available: bool,
}

pub fn run(config: &CoreConfig, json: bool) -> Result<u8, String> {
    let rows = collect(&TypeStore::new(StoreLayout::new(&config.paths.data_dir)))?;
    if json {
        println!("{}", json_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("no bridge types found");
    } else {
        println!("{:<20} {:<12} {:<12} UPDATE", "TYPE", "INSTALLED", "STAGED");
        for row in &rows {
            println!(
                "{:<20} {:<12} {:<12} {}",
                row.type_id,
                or_dash(row.installed.as_deref()),
                or_dash(row.staged.as_deref()),
                if row.update_available { "yes" } else { "no" }
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

fn collect(store: &TypeStore) -> Result<Vec<TypeRow>, String> {
    let mut rows = Vec::new();
    for type_id in store.list().map_err(|e| e.to_string())? {
        let record = store.load(&type_id).map_err(|e| e.to_string())?;
        if record.is_empty() {
            continue;
        }
        let version = |d: &bridgekeeper_schema::BridgeTypeDescriptor| {
            d.version.clone().unwrap_or_else(|| "latest".to_owned())
        };
        rows.push(TypeRow {
            installed: record.local.as_ref().map(version),
            staged: record.pending.as_ref().map(version),
            update_available: record.update_available(),
            type_id,
        });
    }
    Ok(rows)
}
