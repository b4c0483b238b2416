//! End-to-end pipeline run over real files: four sheets in, reports and
//! snapshots out, then a commit against a scripted backend.

use std::path::PathBuf;

use async_trait::async_trait;
use cir_backend::{BackendApi, BackendError, Entity, UpsertResponse};
use cir_merge::{ImportPipeline, LinkOverrides, PipelineConfig, SheetPaths};
use cir_sheets::SheetConfig;
use serde_json::Value;
use tempfile::tempdir;

const CONTACTS_CSV: &str = "\
Contact ID,Name,Email,Phone,Account ID,Account Name,Tags,Street,City,State,Zip
C1,Jane Doe,jane@acme.com,555-867-5309,A1,Acme Plumbing,vip,12 Oak St,Springfield,IL,62704
C2,Sam Roe,sam@beta.com,555-222-3333,A2,Beta Heating,,,,,
";

const LEADS_CSV: &str = "\
Name,Company,Contact ID,Email,Do Not Email
Jane Doe,Acme Plumbing,C1,,yes
Pat Lee,Beta Heating LLC,,pat@nowhere.com,
";

const ESTIMATES_CSV: &str = "\
Estimate ID,Client,Status,Estimate Date,Total,Email,Contact ID
E1,Acme Plumbing,Won,2025-03-15,\"$1,200.50\",,C1
E2,Nobody Knows Who,Pending,,,,
";

const JOBSITES_CSV: &str = "\
Jobsite ID,Jobsite Name,Street,City,State,Zip,Contact ID
J1,Acme Plumbing,12 Oak St,Springfield,IL,62704,
J2,Mystery Site,1 Nowhere Ln,,,,
";

struct RecordingBackend;

#[async_trait]
impl BackendApi for RecordingBackend {
    async fn fetch_existing(&self, _entity: Entity) -> Result<Vec<Value>, BackendError> {
        Ok(Vec::new())
    }

    async fn bulk_upsert(
        &self,
        _entity: Entity,
        records: &[Value],
        lookup_field: &str,
    ) -> Result<UpsertResponse, BackendError> {
        assert_eq!(lookup_field, "external_id");
        Ok(UpsertResponse {
            success: true,
            created: records.len() as u64,
            updated: 0,
            total: records.len() as u64,
            error: None,
        })
    }
}

fn write_sheets(dir: &std::path::Path) -> SheetPaths {
    let write = |name: &str, body: &str| -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).expect("write sheet");
        path
    };
    SheetPaths {
        contacts: write("contacts.csv", CONTACTS_CSV),
        leads: write("leads.csv", LEADS_CSV),
        estimates: write("estimates.csv", ESTIMATES_CSV),
        jobsites: write("jobsites.csv", JOBSITES_CSV),
    }
}

#[tokio::test]
async fn merge_run_writes_reports_and_snapshots() {
    let dir = tempdir().expect("tempdir");
    let paths = write_sheets(dir.path());
    let pipeline = ImportPipeline::new(PipelineConfig {
        out_root: dir.path().join("reports"),
        vault_dir: dir.path().join("vault"),
        batch_size: 500,
    });

    let report = pipeline
        .merge_once(&paths, &SheetConfig::default(), &LinkOverrides::default())
        .await
        .expect("merge");

    assert_eq!(report.merged.stats.total_accounts, 2);
    assert_eq!(report.merged.stats.total_contacts, 3);
    assert_eq!(report.merged.stats.matched_contacts, 1);
    assert_eq!(report.merged.stats.new_contacts_from_leads, 1);
    assert_eq!(report.merged.estimates.len(), 2);
    assert_eq!(report.merged.stats.estimate_linking.linked_by_contact_id, 1);
    assert_eq!(report.merged.stats.estimate_linking.orphaned, 1);
    assert_eq!(report.merged.orphaned_jobsites, vec!["J2".to_string()]);

    let reports_dir = PathBuf::from(&report.reports_dir);
    assert!(reports_dir.join("import_summary.md").exists());
    assert!(reports_dir.join("merge_result.json").exists());
    let manifest: Value = serde_json::from_str(
        &std::fs::read_to_string(reports_dir.join("snapshots/manifest.json")).expect("manifest"),
    )
    .expect("manifest json");
    let files = manifest["files"].as_array().expect("files");
    assert_eq!(files.len(), 4);
    for file in files {
        assert_eq!(file["sha256"].as_str().expect("sha").len(), 64);
        assert!(reports_dir
            .join("snapshots")
            .join(
                PathBuf::from(file["path"].as_str().expect("path"))
                    .file_name()
                    .expect("file name")
            )
            .exists());
    }

    // the uploaded sheets are archived in the vault
    assert!(dir.path().join("vault/contacts").is_dir());

    let outcome = pipeline
        .commit(&RecordingBackend, &report.merged, &report.valid_ids)
        .await;
    assert!(outcome.success);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.entities["accounts"].pushed, 2);
    assert_eq!(outcome.entities["contacts"].pushed, 3);
    assert_eq!(outcome.entities["estimates"].pushed, 2);
    assert_eq!(outcome.entities["jobsites"].pushed, 2);
}

#[tokio::test]
async fn layout_failure_on_one_sheet_blocks_merge() {
    let dir = tempdir().expect("tempdir");
    let mut paths = write_sheets(dir.path());
    let bad = dir.path().join("bad_estimates.csv");
    std::fs::write(&bad, "Totally,Unrelated,Columns\n1,2,3\n").expect("write");
    paths.estimates = bad;

    let pipeline = ImportPipeline::new(PipelineConfig {
        out_root: dir.path().join("reports"),
        vault_dir: dir.path().join("vault"),
        batch_size: 500,
    });
    let err = pipeline
        .merge_once(&paths, &SheetConfig::default(), &LinkOverrides::default())
        .await
        .expect_err("layout error must block the merge");
    assert!(err.to_string().contains("estimates"));
}
