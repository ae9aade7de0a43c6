use serde_json::{json, Map, Value};
use sitesync_core::{EntityKind, OfflineApi};

use crate::error::CliError;

/// Demo reference data keyed by kind, in foreign-key order
pub fn demo_records() -> Vec<(EntityKind, Vec<Map<String, Value>>)> {
    vec![
        (
            EntityKind::Company,
            objects(&[json!({
                "id": "demo-company",
                "name": "Northwind Builders",
                "status": "active"
            })]),
        ),
        (
            EntityKind::Project,
            objects(&[
                json!({
                    "id": "demo-project-depot",
                    "name": "Harbour Depot Extension",
                    "companyId": "demo-company",
                    "status": "active"
                }),
                json!({
                    "id": "demo-project-school",
                    "name": "Elm Street School Refit",
                    "companyId": "demo-company",
                    "status": "planning"
                }),
            ]),
        ),
        (
            EntityKind::Warehouse,
            objects(&[json!({
                "id": "demo-warehouse",
                "name": "Yard 2",
                "companyId": "demo-company"
            })]),
        ),
        (
            EntityKind::Equipment,
            objects(&[
                json!({
                    "id": "demo-excavator",
                    "name": "Excavator EX-210",
                    "companyId": "demo-company",
                    "projectId": "demo-project-depot",
                    "status": "on-site"
                }),
                json!({
                    "id": "demo-mixer",
                    "name": "Concrete mixer CM-3",
                    "companyId": "demo-company",
                    "projectId": "demo-project-school",
                    "status": "maintenance"
                }),
            ]),
        ),
        (
            EntityKind::Transaction,
            objects(&[json!({
                "id": "demo-invoice-1",
                "description": "Rebar delivery",
                "amount": 4_250,
                "companyId": "demo-company",
                "projectId": "demo-project-depot",
                "status": "approved"
            })]),
        ),
    ]
}

pub async fn run_seed(api: &OfflineApi) -> Result<(), CliError> {
    let mut total = 0;
    for (kind, records) in demo_records() {
        let inserted = api.bulk_seed(kind, records).await?;
        if inserted == 0 {
            println!("{kind}: already populated, skipped");
        } else {
            println!("{kind}: {inserted} seeded");
        }
        total += inserted;
    }
    tracing::info!(total, "Seeded demo records");
    Ok(())
}

fn objects(values: &[Value]) -> Vec<Map<String, Value>> {
    values
        .iter()
        .filter_map(|value| value.as_object().cloned())
        .collect()
}
