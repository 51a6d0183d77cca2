// HTTP surface

mod common;

use axum_test::TestServer;
use common::{fast_settings, Fixture};
use lessor_common::{InstanceState, Network};
use lessor_orchestrator::api::create_router;
use serde_json::{json, Value};

fn server(fx: &Fixture) -> TestServer {
    TestServer::new(create_router(fx.state.clone())).unwrap()
}

fn create_body(agreement_id: &str, services: Value) -> Value {
    json!({
        "agreement_id": agreement_id,
        "network": "holesky",
        "instance_name": "api-box",
        "demand_options": {
            "capabilities": ["vpn"],
            "image_tag": "lessor/ubuntu:22.04",
            "min_mem_gib": 4
        },
        "order_options": {"rent_hours": 2.0, "pricing": {"max_cpu_per_hour": 0.1}},
        "allocation_id": "alloc-1",
        "services": services
    })
}

#[tokio::test]
async fn test_root_and_health() {
    let fx = Fixture::new();
    let server = server(&fx);

    let response = server.get("/").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.text(), "Lessor Orchestrator Online");

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["monitor_running"], false);
}

#[tokio::test]
async fn test_create_and_terminate_instance() {
    let fx = Fixture::with_settings(fast_settings());
    let server = server(&fx);

    let response = server
        .post("/instances")
        .json(&create_body("tmp-api", json!([{"name": "web"}])))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["agreement_id"], "agreement-1");
    assert_eq!(body["data"]["state"], "Active");
    assert_eq!(body["data"]["endpoint"], "activity-1.test.local");
    assert_eq!(body["data"]["configure"]["demand_options"]["min_mem_gib"], 4);

    let response = server
        .post("/instances/terminate")
        .json(&json!({"network": "holesky", "agreement_ids": ["agreement-1"]}))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"]["terminated"], json!(["agreement-1"]));

    let record = fx
        .state
        .records
        .get_instance("agreement-1", Network::Holesky)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, InstanceState::Terminated);
}

#[tokio::test]
async fn test_unknown_service_is_a_validation_error() {
    let fx = Fixture::new();
    let server = server(&fx);

    let response = server
        .post("/instances")
        .json(&create_body("tmp-api", json!([{"name": "ftp"}])))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "validation_error");
    assert!(fx.market(Network::Holesky).rentals().is_empty());
    assert!(fx
        .state
        .records
        .get_instance("tmp-api", Network::Holesky)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unsupported_network_is_rejected() {
    let fx = Fixture::new();
    let server = server(&fx);

    let response = server.post("/instances/mainnet/a-1/retry").await;
    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["details"], "Network not supported: mainnet");

    let response = server
        .post("/instances/terminate")
        .json(&json!({"network": "mainnet", "agreement_ids": ["a-1"]}))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_terminate_without_ids() {
    let fx = Fixture::new();
    let response = server(&fx)
        .post("/instances/terminate")
        .json(&json!({"network": "polygon", "agreement_ids": []}))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_retry_of_unknown_instance() {
    let fx = Fixture::new();
    let response = server(&fx).post("/instances/holesky/missing/retry").await;
    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_vpn_routes() {
    let fx = Fixture::new();
    let server = server(&fx);

    let response = server
        .post("/vpns")
        .json(&json!({"network": "polygon", "name": "lab", "cidr": "10.0.0.0/24"}))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    let vpn_id = body["data"]["vpn_id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["state"], "Active");

    let response = server.get(&format!("/vpns/polygon/{vpn_id}/nodes")).await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"], json!(["192.168.0.1"]));

    let response = server.delete(&format!("/vpns/polygon/{vpn_id}")).await;
    assert_eq!(response.status_code(), 200);

    let response = server.delete(&format!("/vpns/polygon/{vpn_id}")).await;
    assert_eq!(response.status_code(), 404);
}

/// SOCKS5 proxy that grants every CONNECT without dialing out.
async fn socks5_proxy() -> u16 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                conn.read_exact(&mut greeting).await?;
                let mut methods = vec![0u8; greeting[1] as usize];
                conn.read_exact(&mut methods).await?;
                conn.write_all(&[5, 0]).await?;

                let mut request = [0u8; 4];
                conn.read_exact(&mut request).await?;
                let addr_len = match request[3] {
                    1 => 4,
                    4 => 16,
                    _ => conn.read_u8().await? as usize,
                };
                let mut rest = vec![0u8; addr_len + 2];
                conn.read_exact(&mut rest).await?;
                conn.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 80]).await?;
                let _ = conn.read(&mut [0u8; 1]).await;
                Ok::<_, std::io::Error>(())
            });
        }
    });
    port
}

#[tokio::test]
async fn test_check_socks5() {
    let fx = Fixture::new();
    let server = server(&fx);

    let port = socks5_proxy().await;
    let response = server
        .post("/check_socks5")
        .json(&json!({"host": "127.0.0.1", "port": port}))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"], format!("socks5://127.0.0.1:{port}"));

    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let response = server
        .post("/check_socks5")
        .json(&json!({"host": "127.0.0.1", "port": closed}))
        .await;
    assert_eq!(response.status_code(), 202);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
}
