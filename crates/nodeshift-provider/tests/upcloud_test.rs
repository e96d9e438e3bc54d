//! UpCloud adapter against a mock API

use nodeshift_proto::CreateInstanceRequest;
use nodeshift_provider::{HttpOptions, ProviderAdapter, UpCloud};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(server: &MockServer) -> UpCloud {
    UpCloud::new("api-user", "api-pass", &HttpOptions::default())
        .unwrap()
        .with_api_base(server.uri())
        .with_delete_retry_delay(Duration::from_millis(10))
}

async fn mount_zones(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/zone"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "zones": {"zone": [
                {"id": "de-fra1", "description": "Frankfurt #1", "public": "yes"},
                {"id": "nl-ams1", "description": "Amsterdam #1", "public": "yes"},
                {"id": "uk-lon1", "description": "London #1", "public": "yes"},
                {"id": "fi-dev1", "description": "Private", "public": "no"}
            ]}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/plan"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "plans": {"plan": [{"name": "1xCPU-1GB"}, {"name": "2xCPU-4GB"}]}
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_regions_exclude_disabled_countries() {
    let server = MockServer::start().await;
    mount_zones(&server).await;
    let adapter = adapter(&server);

    let disabled: HashSet<String> = ["DE".to_string(), "gb".to_string()].into_iter().collect();
    let regions = adapter.list_regions("1xCPU-1GB", &disabled).await.unwrap();

    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].id, "nl-ams1");
    assert_eq!(regions[0].country, "NL");
}

#[tokio::test]
async fn test_unknown_plan_has_no_regions() {
    let server = MockServer::start().await;
    mount_zones(&server).await;

    let regions = adapter(&server)
        .list_regions("64xCPU-512GB", &HashSet::new())
        .await
        .unwrap();
    assert!(regions.is_empty());
}

#[tokio::test]
async fn test_countries() {
    let server = MockServer::start().await;
    mount_zones(&server).await;

    let countries = adapter(&server).list_countries().await.unwrap();
    assert_eq!(countries, vec!["DE", "GB", "NL"]);
}

#[tokio::test]
async fn test_create_passes_key_inline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/server"))
        .and(body_partial_json(json!({
            "server": {
                "zone": "nl-ams1",
                "login_user": {"ssh_keys": {"ssh_key": ["ssh-ed25519 AAAA nodeshift"]}}
            }
        })))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "server": {
                "uuid": "0077fa3d-32db-4b09-9f5f-30d9e9afb565",
                "title": "nodeshift-abc",
                "zone": "nl-ams1",
                "ip_addresses": {"ip_address": [
                    {"address": "94.237.0.10", "access": "public", "family": "IPv4"}
                ]}
            }
        })))
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    let key_id = adapter
        .add_key("ssh-ed25519 AAAA nodeshift", "ignored")
        .await
        .unwrap();

    let created = adapter
        .create_instance(&CreateInstanceRequest {
            region: "nl-ams1".to_string(),
            name: "nodeshift-abc".to_string(),
            size: "1xCPU-1GB".to_string(),
            image: "01000000-0000-4000-8000-000030220200".to_string(),
            key_id,
            user_data: "#!/bin/sh\n".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(created.instance.name, "nodeshift-abc");
    assert_eq!(created.instance.public_ip, Some("94.237.0.10".parse().unwrap()));
}

#[tokio::test]
async fn test_list_instances_single_group() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "servers": {"server": [
                {"uuid": "a", "title": "nodeshift-1", "zone": "de-fra1"},
                {"uuid": "b", "title": "other", "zone": "nl-ams1"}
            ]}
        })))
        .mount(&server)
        .await;

    let groups = adapter(&server).list_instances().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].api_base, server.uri());
    assert_eq!(groups[0].instances.len(), 2);
}

#[tokio::test]
async fn test_delete_missing_server_is_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/server/gone/stop"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/server/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    let ids = vec!["gone".to_string()];
    let summary = adapter.delete_instances(&ids, &server.uri()).await;

    assert!(summary.is_clean());
    assert_eq!(summary.not_found, ids);
}

#[tokio::test]
async fn test_delete_retries_while_server_stops() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/server/busy/stop"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/server/busy"))
        .respond_with(ResponseTemplate::new(409).set_body_string("SERVER_STATE_ILLEGAL"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/server/busy"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let summary = adapter(&server)
        .delete_instances(&["busy".to_string()], &server.uri())
        .await;
    assert_eq!(summary.deleted, vec!["busy".to_string()]);
}
