use super::*;
use chrono::TimeZone;
use mockito::{Matcher, Server};

fn inverter(url: String) -> InverterConfig {
    InverterConfig {
        name: "sb71".into(),
        url,
        group: UserGroup::User,
        password: "secret".into(),
    }
}

#[test]
fn parses_numbers_strings_and_tags() {
    // Arrange
    let body = json!({
        "result": {
            "0199-xxxxx385": {
                "6100_40263F00": { "1": [{ "val": 2480 }] },
                "6380_40251E00": { "1": [{ "val": 1300 }, { "val": 1250 }] },
                "6180_08414C00": { "1": [{ "val": [{ "tag": 307 }] }] },
                "6100_00465700": { "1": [{ "val": 5001 }] },
                "6100_0046C200": { "1": [{ "val": null }] }
            }
        }
    });
    let scales: HashMap<String, f64> = [("6100_00465700".to_string(), 0.01)].into_iter().collect();

    // Act
    let readings = parse_values(&body, &scales).expect("valid response");

    // Assert
    assert_eq!(readings["6100_40263F00"], Reading::Number(2480.0));
    assert_eq!(readings["6180_08414C00"], Reading::Tag(307));
    assert_eq!(readings["6100_0046C200"], Reading::Number(0.0));
    assert_eq!(readings["6380_40251E00"].total(), Some(2550.0));
    match &readings["6100_00465700"] {
        Reading::Number(hz) => assert!((hz - 50.01).abs() < 1e-9),
        other => panic!("unexpected reading {other:?}"),
    }
}

#[test]
fn err_codes_map_to_device_errors() {
    assert!(matches!(check_err(&json!({ "err": 401 })), Err(DeviceError::AuthFailed(_))));
    assert!(matches!(check_err(&json!({ "err": 503 })), Err(DeviceError::AuthFailed(_))));
    assert!(matches!(check_err(&json!({ "err": 404 })), Err(DeviceError::Malformed(_))));
    assert!(check_err(&json!({ "result": {} })).is_ok());
}

#[test]
fn history_keeps_null_values_as_missing() {
    let body = json!({
        "result": {
            "0199-xxxxx385": [
                { "t": 1_700_000_000, "v": 123_456 },
                { "t": 1_700_000_300, "v": null }
            ]
        }
    });

    let history = parse_history(&body).expect("valid logger response");

    assert_eq!(history.len(), 2);
    assert_eq!(history[0].v, Some(123_456.0));
    assert_eq!(history[1].v, None);
}

#[tokio::test]
async fn fetch_logs_in_once_and_reuses_the_session() {
    // Arrange
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", "/dyn/login.json")
        .match_body(Matcher::Json(json!({ "right": "usr", "pass": "secret" })))
        .with_status(200)
        .with_body(json!({ "result": { "sid": "abc123" } }).to_string())
        .expect(1)
        .create_async()
        .await;
    let metadata = server
        .mock("GET", "/data/ObjectMetadata_Istl.json")
        .with_status(200)
        .with_body(json!({ "6100_40263F00": { "Typ": 0, "Scale": 1 } }).to_string())
        .expect(1)
        .create_async()
        .await;
    let values = server
        .mock("POST", "/dyn/getAllOnlValues.json")
        .match_query(Matcher::UrlEncoded("sid".into(), "abc123".into()))
        .with_status(200)
        .with_body(
            json!({ "result": { "0199-x": { "6100_40263F00": { "1": [{ "val": 812 }] } } } })
                .to_string(),
        )
        .expect(2)
        .create_async()
        .await;
    let client = SmaClient::new(&inverter(server.url())).expect("client");

    // Act
    let first = client.fetch().await.expect("first fetch");
    let second = client.fetch().await.expect("second fetch");

    // Assert
    assert_eq!(first["6100_40263F00"], Reading::Number(812.0));
    assert_eq!(first, second);
    login.assert_async().await;
    metadata.assert_async().await;
    values.assert_async().await;
}

#[tokio::test]
async fn rejected_session_is_dropped_and_close_skips_logout() {
    // Arrange
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/dyn/login.json")
        .with_status(200)
        .with_body(json!({ "result": { "sid": "stale" } }).to_string())
        .create_async()
        .await;
    server
        .mock("GET", "/data/ObjectMetadata_Istl.json")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;
    let values = server
        .mock("POST", "/dyn/getAllOnlValues.json")
        .match_query(Matcher::UrlEncoded("sid".into(), "stale".into()))
        .with_status(200)
        .with_body(json!({ "err": 401 }).to_string())
        .expect(1)
        .create_async()
        .await;
    let logout = server
        .mock("POST", "/dyn/logout.json")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let client = SmaClient::new(&inverter(server.url())).expect("client");

    // Act
    let result = client.fetch().await;

    // Assert
    assert!(matches!(result, Err(DeviceError::AuthFailed(_))), "got {result:?}");
    values.assert_async().await;
    client.close().await.expect("close without session");
    logout.assert_async().await;
}

#[tokio::test]
async fn history_request_carries_logger_key_and_window() {
    // Arrange
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single().expect("valid date");
    let end = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).single().expect("valid date");
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/dyn/login.json")
        .with_status(200)
        .with_body(json!({ "result": { "sid": "s1" } }).to_string())
        .create_async()
        .await;
    let logger = server
        .mock("POST", "/dyn/getLogger.json")
        .match_query(Matcher::UrlEncoded("sid".into(), "s1".into()))
        .match_body(Matcher::Json(json!({
            "destDev": [],
            "key": 28704,
            "tStart": start.timestamp(),
            "tEnd": end.timestamp(),
        })))
        .with_status(200)
        .with_body(json!({ "result": { "0199-x": [{ "t": start.timestamp(), "v": 5000 }] } }).to_string())
        .create_async()
        .await;
    let logout = server
        .mock("POST", "/dyn/logout.json")
        .match_query(Matcher::UrlEncoded("sid".into(), "s1".into()))
        .with_status(200)
        .with_body(json!({ "result": { "isLogin": false } }).to_string())
        .create_async()
        .await;
    let client = SmaClient::new(&inverter(server.url())).expect("client");

    // Act
    let history = client.fetch_history(start, end).await.expect("history");
    client.close().await.expect("logout");

    // Assert
    assert_eq!(history, vec![HistoryPoint { t: start.timestamp(), v: Some(5000.0) }]);
    logger.assert_async().await;
    logout.assert_async().await;
}
