use std::path::Path;

use stagehand::deploy::apps::AppDeployer;
use stagehand::models::ddoc::App;
use stagehand::storage::layout::DeploymentLayout;

fn deployer(root: &Path) -> AppDeployer {
    AppDeployer::new(DeploymentLayout::new(root.join("deployments")))
}

async fn fake_build(deployer: &AppDeployer, app: &App) {
    let dir = deployer.layout().deploy_dir(app);
    dir.create().await.unwrap();
    dir.file("index.js")
        .write_string(&format!("// {}", app.digest))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_changed_apps_compares_live_digests() {
    let tmp = tempfile::tempdir().unwrap();
    let deployer = deployer(tmp.path());

    let same = App::from_module("api-1.0.0.tgz", "sha256-aaa");
    let upgraded = App::from_module("sentinel-1.1.0.tgz", "sha256-new");
    let dangling = App::from_module("gateway-1.0.0.tgz", "sha256-ggg");
    let missing = App::from_module("admin-1.0.0.tgz", "sha256-mmm");

    for app in [&same, &dangling] {
        fake_build(&deployer, app).await;
        deployer.swap(app).await.unwrap();
    }
    let previous = App::from_module("sentinel-1.0.0.tgz", "sha256-old");
    fake_build(&deployer, &previous).await;
    deployer.swap(&previous).await.unwrap();

    // the gateway build vanished from under its link
    deployer.layout().deploy_dir(&dangling).delete().await.unwrap();

    let apps = vec![same.clone(), upgraded.clone(), dangling.clone(), missing.clone()];
    let changed: Vec<String> = deployer
        .changed_apps(&apps)
        .await
        .unwrap()
        .into_iter()
        .map(|app| app.name)
        .collect();

    assert_eq!(changed, vec!["sentinel", "gateway", "admin"]);
}

#[tokio::test]
async fn test_interrupted_swap_is_recovered() {
    let tmp = tempfile::tempdir().unwrap();
    let deployer = deployer(tmp.path());
    let layout = deployer.layout().clone();

    let v1 = App::from_module("api-1.0.0.tgz", "sha256-one");
    let v2 = App::from_module("api-2.0.0.tgz", "sha256-two");
    fake_build(&deployer, &v1).await;
    deployer.swap(&v1).await.unwrap();
    fake_build(&deployer, &v2).await;

    // crash between moving the live build to `old` and relinking `current`
    layout.old("api").point_to(layout.deploy_dir(&v1).path()).await.unwrap();
    layout.current("api").remove().await.unwrap();
    assert!(deployer.is_changed(&v2).await.unwrap());

    deployer.swap(&v2).await.unwrap();
    assert_eq!(
        layout.current("api").live_target().await.unwrap().as_deref(),
        Some(layout.deploy_dir(&v2).path())
    );
    assert_eq!(
        layout.old("api").target().await.unwrap().as_deref(),
        Some(layout.deploy_dir(&v1).path())
    );
    assert!(!deployer.is_changed(&v2).await.unwrap());

    deployer.prune("api").await.unwrap();
    assert!(!layout.deploy_dir(&v1).exists().await);
    assert!(layout.deploy_dir(&v2).exists().await);
    assert!(!layout.old("api").exists().await);
    assert_eq!(deployer.installed_apps().await.unwrap(), vec!["api"]);
}

#[tokio::test]
async fn test_swap_twice_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let deployer = deployer(tmp.path());
    let layout = deployer.layout().clone();

    let v1 = App::from_module("api-1.0.0.tgz", "sha256-one");
    let v2 = App::from_module("api-2.0.0.tgz", "sha256-two");
    for app in [&v1, &v2] {
        fake_build(&deployer, app).await;
    }

    deployer.swap(&v1).await.unwrap();
    deployer.swap(&v2).await.unwrap();
    deployer.swap(&v2).await.unwrap();

    assert_eq!(
        layout.old("api").target().await.unwrap().as_deref(),
        Some(layout.deploy_dir(&v1).path())
    );
    assert_eq!(
        layout.current("api").live_target().await.unwrap().as_deref(),
        Some(layout.deploy_dir(&v2).path())
    );
}

#[tokio::test]
async fn test_prune_without_builds_is_a_no_op() {
    let tmp = tempfile::tempdir().unwrap();
    let deployer = deployer(tmp.path());

    deployer.prune("never-installed").await.unwrap();
    assert!(deployer.installed_apps().await.unwrap().is_empty());
}
