use super::{block_on, json_pretty, or_dash, EXIT_SUCCESS};
use bridgekeeper_core::CoreConfig;
use bridgekeeper_remote::{CatalogClient, HttpCatalog};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    type_id: String,
    title: String,
    registry: String,
    version: Option<String>,
}

pub fn run(config: &CoreConfig, json: bool) -> Result<u8, String> {
    let catalog = config
        .catalog
        .clone()
        .ok_or_else(|| "configuration error: no catalog configured".to_owned())?;
    let client = HttpCatalog::new(catalog);
    let entries = block_on(fetch(&client))??;

    if json {
        println!("{}", json_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("catalog offers no bridge types");
    } else {
        println!("{:<20} {:<12} REGISTRY", "TYPE", "VERSION");
        for entry in &entries {
            println!(
                "{:<20} {:<12} {}",
                entry.type_id,
                or_dash(entry.version.as_deref()),
                entry.registry
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

async fn fetch(client: &dyn CatalogClient) -> Result<Vec<CatalogEntry>, String> {
    let types = client.list_types().await.map_err(|e| e.to_string())?;
    let mut entries = Vec::with_capacity(types.len());
    for type_id in types {
        match client.type_descriptor(&type_id).await {
            Ok(d) => entries.push(CatalogEntry {
                type_id,
                title: d.title,
                registry: d.registry,
                version: d.version,
            }),
            Err(e) => warn!("skipping {type_id}: {e}"),
        }
    }
    Ok(entries)
}
