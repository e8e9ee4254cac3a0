mod common;

use common::sample_db_record;
use rds_agent::core::catalog::{Catalog, ServiceKind};
use rds_agent::core::errors::AgentError;

#[test]
fn test_insert_get_remove_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(tmp.path()).unwrap();

    let record = sample_db_record("db-1", "c1");
    catalog.insert(record.clone()).unwrap();
    assert!(catalog.exists("db-1"));
    assert_eq!(catalog.get("db-1").unwrap(), record);

    // Ids are globally unique.
    assert!(matches!(
        catalog.insert(sample_db_record("db-1", "c2")),
        Err(AgentError::ServiceExists(_))
    ));

    catalog.remove("db-1").unwrap();
    assert!(!catalog.exists("db-1"));
    assert!(matches!(
        catalog.remove("db-1"),
        Err(AgentError::ServiceNotFound(_))
    ));
}

#[test]
fn test_catalog_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let catalog = Catalog::open(tmp.path()).unwrap();
        catalog.insert(sample_db_record("db-1", "c1")).unwrap();
    }
    let reopened = Catalog::open(tmp.path()).unwrap();
    assert!(reopened.exists("db-1"));
    assert_eq!(reopened.get("db-1").unwrap().cluster_id, "c1");
}

#[test]
fn test_kind_and_cluster_queries() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(tmp.path()).unwrap();

    catalog.insert(sample_db_record("db-b", "c1")).unwrap();
    catalog.insert(sample_db_record("db-a", "c2")).unwrap();
    let mut proxy = sample_db_record("p-1", "c1");
    proxy.service_kind = ServiceKind::Proxysql;
    catalog.insert(proxy).unwrap();

    assert_eq!(catalog.database_ids(), vec!["db-a", "db-b"]);
    assert_eq!(catalog.proxy_ids(None), vec!["p-1"]);
    assert_eq!(catalog.proxy_ids(Some("c1")), vec!["p-1"]);
    assert!(catalog.proxy_ids(Some("c2")).is_empty());
    assert_eq!(catalog.cluster_ids(), vec!["c1", "c2"]);
    assert!(catalog.is_cluster_in_use("c1"));
    assert!(!catalog.is_cluster_in_use("c3"));
}

#[test]
fn test_credentials_for_cluster() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(tmp.path()).unwrap();
    catalog.insert(sample_db_record("db-1", "c1")).unwrap();
    catalog.insert(sample_db_record("db-2", "c1")).unwrap();
    catalog.insert(sample_db_record("db-3", "c2")).unwrap();

    let credentials = catalog.credentials_for_cluster("c1");
    assert_eq!(credentials.len(), 2);
    assert_eq!(credentials[0].username, "svc-db-1");
    assert_eq!(credentials[1].username, "svc-db-2");
}
