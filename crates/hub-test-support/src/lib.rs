//! Shared test utilities for the cloud control hub: a real WebSocket
//! client and a minimal scripted echo server for round-trip tests.

pub mod mock_ws_client;
pub mod mock_ws_server;

pub use mock_ws_client::MockWsClient;
pub use mock_ws_server::MockWsServer;

#[cfg(test)]
mod tests {
    use super::*;
    use hub_protocol::{kind, Envelope};

    #[tokio::test]
    async fn mock_server_starts_and_reports_port() {
        let server = MockWsServer::start("D1").await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn mock_client_round_trips_envelope_with_stamped_udid() {
        let server = MockWsServer::start("D1").await.unwrap();
        let url = format!("ws://{}", server.local_addr());
        let mut client = MockWsClient::connect(&url).await.unwrap();

        let env = Envelope::new(kind::APP_STATE, serde_json::json!({"battery": 80}));
        client.send_envelope(&env).await.unwrap();

        let echoed = client.recv_envelope().await.unwrap();
        assert_eq!(echoed.msg_type, kind::APP_STATE);
        assert_eq!(echoed.udid.as_deref(), Some("D1"));
    }

    #[tokio::test]
    async fn mock_server_handles_multiple_clients_independently() {
        let server = MockWsServer::start("D1").await.unwrap();
        let url = format!("ws://{}", server.local_addr());

        let mut client1 = MockWsClient::connect(&url).await.unwrap();
        let mut client2 = MockWsClient::connect(&url).await.unwrap();

        client1
            .send_envelope(&Envelope::new(kind::APP_STATE, serde_json::json!({"n": 1})))
            .await
            .unwrap();
        client2
            .send_envelope(&Envelope::new(kind::APP_STATE, serde_json::json!({"n": 2})))
            .await
            .unwrap();

        let r1 = client1.recv_envelope().await.unwrap();
        let r2 = client2.recv_envelope().await.unwrap();
        assert_eq!(r1.body["n"], 1);
        assert_eq!(r2.body["n"], 2);
    }
}
