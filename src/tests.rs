use crate::commands::{self, Workspace, EXIT_FAILED, EXIT_OK};
use crate::config::StackclawConfig;
use crate::format::{format_plan, format_report, redact_outputs, FormatOptions, SecretOutputs};
use serde_json::json;
use stackclaw_engine::{Action, NodeState, StateStore};
use std::path::Path;
use std::sync::Arc;

const KEYVAULT: &str = r#"
name: keyvault
config:
  resourceGroupName: rg-demo
  tenantId: "0000"
  adminPassword: { secret: hunter2 }
resources:
  - id: current-rg
    type: azure-native:resources:getResourceGroup
    data: true
    properties:
      resourceGroupName: "${config.resourceGroupName}"
  - id: kv-contoso
    type: azure-native:keyvault:Vault
    properties:
      properties:
        sku: { family: A, name: standard }
        tenantId: "${config.tenantId}"
      resourceGroupName: "${current-rg.name}"
  - id: admin-password
    type: azure-native:keyvault:Secret
    parent: kv-contoso
    properties:
      properties:
        value: "${config.adminPassword}"
      resourceGroupName: "${current-rg.name}"
"#;

fn write_stack(dir: &Path, text: &str) -> std::path::PathBuf {
    let path = dir.join("stack.yaml");
    std::fs::write(&path, text).unwrap();
    path
}

fn open(dir: &Path, text: &str, overrides: &[&str]) -> Workspace {
    let stack = write_stack(dir, text);
    let overrides: Vec<String> = overrides.iter().map(|s| s.to_string()).collect();
    Workspace::open(&stack, &overrides, &StackclawConfig::default()).unwrap()
}

// ===========================================================================
// Workspace
// ===========================================================================

#[test]
fn workspace_derives_paths_next_to_stack_file() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = open(tmp.path(), KEYVAULT, &[]);
    assert_eq!(ws.ctx.stack, "keyvault");
    assert!(ws.ctx.run_id.starts_with("keyvault-"));
    assert_eq!(
        ws.state_path,
        tmp.path().join(".stackclaw/keyvault.state.json")
    );
    assert_eq!(ws.provider_root, tmp.path().join(".stackclaw/resources"));
}

#[test]
fn overrides_replace_config_and_keep_secret_flag() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = open(
        tmp.path(),
        KEYVAULT,
        &["resourceGroupName=rg-prod", "adminPassword=s3cret"],
    );
    let rg = ws.ctx.config.get("resourceGroupName").unwrap();
    assert_eq!(rg.value, json!("rg-prod"));
    let pwd = ws.ctx.config.get("adminPassword").unwrap();
    assert!(pwd.secret);
    assert_eq!(pwd.value, json!("s3cret"));
}

#[test]
fn missing_stack_file_is_invalid() {
    let tmp = tempfile::tempdir().unwrap();
    let err = Workspace::open(
        &tmp.path().join("nope.yaml"),
        &[],
        &StackclawConfig::default(),
    )
    .err()
    .unwrap();
    assert!(err.is_validation());
}

// ===========================================================================
// plan / apply / destroy
// ===========================================================================

#[tokio::test]
async fn keyvault_apply_then_noop_then_destroy() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = open(tmp.path(), KEYVAULT, &[]);
    let store = ws.store();

    let planned = commands::plan(&ws, &store).await.unwrap();
    assert_eq!(planned.plan.action("current-rg"), Some(Action::Read));
    assert_eq!(planned.plan.action("kv-contoso"), Some(Action::Create));
    assert_eq!(planned.plan.action("admin-password"), Some(Action::Create));

    let providers = Arc::new(ws.providers());
    let report = commands::apply(&ws, &store, providers.clone(), &planned)
        .await
        .unwrap();
    assert_eq!(commands::exit_code(&report), EXIT_OK);
    assert_eq!(report.count(NodeState::Succeeded), 3);

    let saved = store.load().await.unwrap();
    assert_eq!(saved.stack, "keyvault");
    assert_eq!(saved.len(), 3);
    assert_eq!(
        saved.get("admin-password").unwrap().properties["resourceGroupName"],
        json!("rg-demo")
    );

    // Second plan against saved state changes nothing
    let again = commands::plan(&ws, &store).await.unwrap();
    let summary = again.plan.summary();
    assert_eq!(summary.changes(), 0);
    assert_eq!(summary.noop, 2);
    assert_eq!(summary.read, 1);

    let destroyed = commands::destroy(&ws, &store, providers).await.unwrap();
    assert_eq!(commands::exit_code(&destroyed), EXIT_OK);
    assert!(store.load().await.unwrap().is_empty());
    let vaults = tmp.path().join(".stackclaw/resources/azure-native/keyvault/Vault");
    assert_eq!(std::fs::read_dir(vaults).unwrap().count(), 0);
}

#[tokio::test]
async fn cycle_is_reported_by_plan() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = open(
        tmp.path(),
        r#"
name: loop
resources:
  - id: a
    type: local:file:File
    dependsOn: [b]
  - id: b
    type: local:file:File
    properties:
      content: "${a.id}"
"#,
        &[],
    );
    let err = commands::plan(&ws, &ws.store()).await.err().unwrap();
    assert!(err.is_validation());
    assert!(err.to_string().contains("a -> b -> a") || err.to_string().contains("b -> a -> b"));
}

#[tokio::test]
async fn failed_node_gives_exit_code_one() {
    let tmp = tempfile::tempdir().unwrap();
    // Read of a lookup with no string argument fails in the local provider
    let ws = open(
        tmp.path(),
        r#"
name: broken
resources:
  - id: lookup
    type: local:data:get
    data: true
    properties:
      count: 3
  - id: user
    type: local:file:File
    properties:
      from: "${lookup.id}"
  - id: independent
    type: local:file:File
"#,
        &[],
    );
    let store = ws.store();
    let planned = commands::plan(&ws, &store).await.unwrap();
    let report = commands::apply(&ws, &store, Arc::new(ws.providers()), &planned)
        .await
        .unwrap();
    assert_eq!(commands::exit_code(&report), EXIT_FAILED);
    assert_eq!(report.status("lookup"), Some(NodeState::Failed));
    assert_eq!(report.status("user"), Some(NodeState::Skipped));
    assert_eq!(report.status("independent"), Some(NodeState::Succeeded));
    assert_eq!(store.load().await.unwrap().len(), 1);
}

#[tokio::test]
async fn run_manifest_is_written_next_to_state() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = open(tmp.path(), KEYVAULT, &[]);
    let store = ws.store();
    let planned = commands::plan(&ws, &store).await.unwrap();
    let report = commands::apply(&ws, &store, Arc::new(ws.providers()), &planned)
        .await
        .unwrap();

    let path = commands::record_run(&ws.state_path, &report.manifest)
        .await
        .unwrap();
    assert_eq!(path.parent().unwrap(), tmp.path().join(".stackclaw/runs"));
    let yaml = std::fs::read_to_string(&path).unwrap();
    assert!(yaml.contains(&ws.ctx.run_id));
    assert!(yaml.contains("succeeded"));
    let log = std::fs::read_to_string(tmp.path().join(".stackclaw/runs/runs.log")).unwrap();
    assert!(log.contains("| keyvault | apply |"));
}

// ===========================================================================
// Formatting
// ===========================================================================

#[tokio::test]
async fn plan_output_redacts_secrets() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = open(tmp.path(), KEYVAULT, &[]);
    let planned = commands::plan(&ws, &ws.store()).await.unwrap();
    let text = format_plan(&ws.ctx, &planned.graph, &planned.plan, &FormatOptions::default());

    assert!(text.contains("═══ Stack keyvault ═══"));
    assert!(text.contains("  = current-rg  azure-native:resources:getResourceGroup"));
    assert!(text.contains("  + kv-contoso  azure-native:keyvault:Vault"));
    assert!(text.contains("[secret]"));
    assert!(!text.contains("hunter2"));
    assert!(text.contains("Plan: 2 to create, 0 to update, 0 to delete, 1 to read, 0 unchanged."));
}

#[tokio::test]
async fn report_output_redacts_secret_outputs() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = open(tmp.path(), KEYVAULT, &[]);
    let store = ws.store();
    let planned = commands::plan(&ws, &store).await.unwrap();
    let report = commands::apply(&ws, &store, Arc::new(ws.providers()), &planned)
        .await
        .unwrap();

    let text = format_report(&report, &planned.graph, &FormatOptions::default());
    assert!(text.contains("apply keyvault-"));
    assert!(text.contains("3 succeeded, 0 failed, 0 skipped"));
    assert!(text.contains("Outputs:"));
    assert!(!text.contains("hunter2"));

    let secrets = SecretOutputs::new(&planned.graph);
    let outputs = &report.outputs[&stackclaw_core::NodeId::new("admin-password")];
    let shown = redact_outputs(&secrets, "admin-password", outputs);
    assert_eq!(shown["properties"], json!("[secret]"));
    assert_eq!(shown["resourceGroupName"], json!("rg-demo"));
}

#[tokio::test]
async fn report_redacts_secrets_passed_through_references() {
    let tmp = tempfile::tempdir().unwrap();
    let stack = format!(
        "{}{}",
        KEYVAULT,
        r#"  - id: copy
    type: local:file:File
    properties:
      mirrored: "${admin-password.properties}"
  - id: copy-of-copy
    type: local:file:File
    properties:
      again: "${copy.mirrored.value}"
      plain: "${kv-contoso.resourceGroupName}"
"#
    );
    let ws = open(tmp.path(), &stack, &[]);
    let store = ws.store();
    let planned = commands::plan(&ws, &store).await.unwrap();
    let report = commands::apply(&ws, &store, Arc::new(ws.providers()), &planned)
        .await
        .unwrap();
    assert_eq!(commands::exit_code(&report), EXIT_OK);

    let secrets = SecretOutputs::new(&planned.graph);
    assert!(secrets.is_secret("copy", "mirrored"));
    assert!(secrets.is_secret("copy-of-copy", "again"));
    assert!(!secrets.is_secret("copy-of-copy", "plain"));

    let text = format_report(&report, &planned.graph, &FormatOptions::default());
    assert!(!text.contains("hunter2"));
    assert!(text.contains("mirrored = \"[secret]\""));
    assert!(text.contains("plain = \"rg-demo\""));
}
