//! kind bootstrap cluster lifecycle

use gokp_cli::bootstrap::{BootstrapCluster, KindBootstrap};
use gokp_cli::run::EndpointRole;
use gokp_cli::ErrorKind;

const NAME: &str = "gokp-bootstrap-test";

/// Story: the bootstrap cluster comes up with a usable kubeconfig, refuses
/// to be created twice and can be deleted repeatedly
#[tokio::test]
#[ignore = "requires docker and kind - run with: cargo test --test kind -- --ignored"]
async fn story_bootstrap_cluster_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let kubeconfig = dir.path().join("kind.kubeconfig");
    let kind = KindBootstrap::default();

    let endpoint = kind.create(NAME, &kubeconfig).await.expect("create failed");
    assert_eq!(endpoint.role, EndpointRole::Bootstrap);
    assert!(kubeconfig.is_file());
    endpoint.client().await.expect("kubeconfig unusable");

    let err = kind.create(NAME, &kubeconfig).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    kind.destroy(NAME).await.expect("destroy failed");
    kind.destroy(NAME).await.expect("second destroy failed");
}
