use clap::Parser;
use fshuttle::{Shuttle, catalog::EdmCatalog, config::ShuttleConfig};
use shuttle::{Cli, execute};
use std::path::PathBuf;
use tempfile::tempdir;

fn fixture(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../fshuttle/tests/fixtures")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

#[tokio::test]
async fn test_validate_accepts_fixture_plan() -> anyhow::Result<()> {
    let cli = Cli::try_parse_from([
        "shuttle",
        "validate",
        "--plan",
        &fixture("cars_plan.json"),
        "--catalog",
        &fixture("catalog.json"),
    ])?;
    execute(cli).await
}

#[tokio::test]
async fn test_run_csv_into_base_path() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let base = dir.path().to_string_lossy().into_owned();
    let cli = Cli::try_parse_from([
        "shuttle",
        "run",
        "--plan",
        &fixture("cars_plan.json"),
        "--catalog",
        &fixture("catalog.json"),
        "--csv",
        &fixture("cars.csv"),
        "--base-path",
        &base,
        "--parallelism",
        "2",
    ])?;
    execute(cli).await?;

    let catalog = EdmCatalog::load(fixture("catalog.json"))?;
    let shuttle = Shuttle::new(ShuttleConfig::new(dir.path()), catalog).await?;
    assert!(shuttle.store.count_rows("entities")? > 0);
    let log = shuttle
        .store
        .get_run_log(1)?
        .ok_or_else(|| anyhow::anyhow!("run was not logged"))?;
    assert_eq!(log.status, "SUCCESS");
    Ok(())
}

#[tokio::test]
async fn test_run_ndjson_with_stable_resolver() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let source = dir.path().join("cars.ndjson");
    std::fs::write(
        &source,
        "{\"id\": \"42\", \"color\": \"red\"}\n\n{\"id\": \"7\", \"color\": \"blue\"}\n",
    )?;
    let base = dir.path().to_string_lossy().into_owned();
    let cli = Cli::try_parse_from([
        "shuttle",
        "run",
        "--plan",
        &fixture("cars_plan.json"),
        "--catalog",
        &fixture("catalog.json"),
        "--ndjson",
        &source.to_string_lossy(),
        "--base-path",
        &base,
        "--resolver",
        "stable",
    ])?;
    execute(cli).await?;

    let catalog = EdmCatalog::load(fixture("catalog.json"))?;
    let shuttle = Shuttle::new(ShuttleConfig::new(dir.path()), catalog).await?;
    assert_eq!(shuttle.store.count_rows("entities")?, 2);
    assert_eq!(shuttle.store.count_rows("id_map")?, 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_base_path_is_rejected() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let missing = dir.path().join("nope").to_string_lossy().into_owned();
    let cli = Cli::try_parse_from([
        "shuttle",
        "run",
        "--plan",
        &fixture("cars_plan.json"),
        "--catalog",
        &fixture("catalog.json"),
        "--csv",
        &fixture("cars.csv"),
        "--base-path",
        &missing,
    ])?;
    let err = execute(cli).await.unwrap_err();
    assert!(err.to_string().contains("does not exist"));
    Ok(())
}

#[tokio::test]
async fn test_validate_rejects_plan_without_remote_handler() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut plan: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(fixture("cars_plan.json"))?)?;
    plan["entities"][0]["properties"][1]["destination"] = serde_json::json!("remote_api");
    let plan_path = dir.path().join("remote_plan.json");
    std::fs::write(&plan_path, plan.to_string())?;
    let plan_path = plan_path.to_string_lossy().into_owned();
    let catalog = fixture("catalog.json");

    let cli = Cli::try_parse_from([
        "shuttle", "validate", "--plan", &plan_path, "--catalog", &catalog,
    ])?;
    let err = execute(cli).await.unwrap_err();
    assert!(format!("{err:#}").contains("remote_api"));

    let cli = Cli::try_parse_from([
        "shuttle",
        "validate",
        "--plan",
        &plan_path,
        "--catalog",
        &catalog,
        "--remote-url",
        "http://127.0.0.1:9/api/",
    ])?;
    execute(cli).await
}
