use super::{block_on, json_pretty, or_dash, EXIT_SUCCESS};
use bridgekeeper_core::CoreConfig;
use bridgekeeper_runtime::{select_runtime, ContainerInfo, ContainerRuntime};
use bridgekeeper_schema::parse_container_name;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct InventoryRow {
    name: String,
    /// Instance id, when the name follows the managed naming scheme.
    id: Option<String>,
    #[serde(rename = "type")]
    type_hint: Option<String>,
    image: String,
    status: String,
}

pub fn run(config: &CoreConfig, all: bool, json: bool) -> Result<u8, String> {
    let runtime =
        select_runtime(&config.runtime.backend).map_err(|e| format!("runtime error: {e}"))?;
    let containers = block_on(runtime.list_containers())?
        .map_err(|e| format!("runtime error: {e}"))?;
    let rows = rows(containers, all);

    if json {
        println!("{}", json_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("no managed containers found");
    } else {
        println!(
            "{:<32} {:<12} {:<16} {:<10} IMAGE",
            "NAME", "ID", "TYPE", "STATUS"
        );
        for row in &rows {
            println!(
                "{:<32} {:<12} {:<16} {:<10} {}",
                row.name,
                or_dash(row.id.as_deref()),
                or_dash(row.type_hint.as_deref()),
                row.status,
                row.image
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

fn rows(containers: Vec<ContainerInfo>, all: bool) -> Vec<InventoryRow> {
    let mut rows: Vec<InventoryRow> = containers
        .into_iter()
        .filter_map(|c| {
            let parsed = parse_container_name(&c.name);
            if parsed.is_none() && !all {
                return None;
            }
            let (id, type_hint) = match parsed {
                Some(p) => (Some(p.id), p.type_hint),
                None => (None, None),
            };
            Some(InventoryRow {
                status: c.status.to_string(),
                name: c.name,
                id,
                type_hint,
                image: c.image,
            })
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    rows
}
