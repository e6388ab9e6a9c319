//! HTTP fragments fetched through the full processor against a mock server

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method};
use pingora_esi::{CancelSignal, EsiConfig, EsiProcessor, RequestInfo};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(headers: HeaderMap) -> RequestInfo {
    RequestInfo::new(Method::GET, "/page".parse().unwrap(), headers)
}

async fn process(processor: &EsiProcessor, req: &RequestInfo, page: String) -> pingora_esi::ProcessedPage {
    processor
        .process_document(req, &HeaderMap::new(), Bytes::from(page), &CancelSignal::never())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_fragment_from_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nav"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<nav/>"))
        .expect(1)
        .mount(&server)
        .await;

    let processor = EsiProcessor::from_config(EsiConfig::default()).unwrap();
    let page = format!("<body><esi:include src=\"{}/nav\"/></body>", server.uri());

    let processed = process(&processor, &request(HeaderMap::new()), page).await;
    assert_eq!(processed.body, Bytes::from("<body><nav/></body>"));
}

#[tokio::test]
async fn test_alias_with_base_url_and_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fragments/header"))
        .respond_with(ResponseTemplate::new(200).set_body_string("HEADER"))
        .mount(&server)
        .await;

    let mut config = EsiConfig::default();
    config
        .resources
        .insert("fragments".to_string(), format!("{}/fragments/", server.uri()));
    let processor = EsiProcessor::from_config(config).unwrap();

    let page = "[<esi:include src=\"fragments\" key=\"header\"/>]".to_string();
    let processed = process(&processor, &request(HeaderMap::new()), page).await;
    assert_eq!(processed.body, Bytes::from("[HEADER]"));
}

#[tokio::test]
async fn test_forward_and_return_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .and(header("x-user", "alice"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("hi alice")
                .insert_header("set-cookie", "seen=1")
                .insert_header("x-internal", "secret"),
        )
        .mount(&server)
        .await;

    let processor = EsiProcessor::from_config(EsiConfig::default()).unwrap();
    let mut headers = HeaderMap::new();
    headers.insert("x-user", HeaderValue::from_static("alice"));
    headers.insert("x-other", HeaderValue::from_static("dropped"));

    let page = format!(
        "<esi:include src=\"{}/user\" forwardheaders=\"x-user\" returnheaders=\"set-cookie\"/>",
        server.uri()
    );
    let processed = process(&processor, &request(headers), page).await;

    assert_eq!(processed.body, Bytes::from("hi alice"));
    assert_eq!(processed.headers.get("set-cookie").unwrap(), "seen=1");
    assert!(processed.headers.get("x-internal").is_none());
}

#[tokio::test]
async fn test_server_error_falls_back() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/spare"))
        .respond_with(ResponseTemplate::new(200).set_body_string("spare"))
        .mount(&server)
        .await;

    let processor = EsiProcessor::from_config(EsiConfig::default()).unwrap();
    let page = format!(
        "<esi:include src=\"{0}/broken\" src=\"{0}/spare\"/>",
        server.uri()
    );
    let processed = process(&processor, &request(HeaderMap::new()), page).await;

    assert_eq!(processed.body, Bytes::from("spare"));
    assert_eq!(processed.fallbacks, 0);
    assert_eq!(processor.metrics().get_stats().failed_fetches, 1);
}

#[tokio::test]
async fn test_slow_fragment_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("too late")
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let processor = EsiProcessor::from_config(EsiConfig::default()).unwrap();
    let page = format!(
        "<esi:include src=\"{}/slow\" timeout=\"100ms\" onerror=\"(unavailable)\"/>",
        server.uri()
    );
    let processed = process(&processor, &request(HeaderMap::new()), page).await;

    assert_eq!(processed.body, Bytes::from("(unavailable)"));
    assert_eq!(processed.fallbacks, 1);
}

#[tokio::test]
async fn test_fragment_cached_with_ttl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/promo"))
        .respond_with(ResponseTemplate::new(200).set_body_string("SALE"))
        .expect(1)
        .mount(&server)
        .await;

    let processor = EsiProcessor::from_config(EsiConfig::default()).unwrap();
    let page = format!("<esi:include src=\"{}/promo\" ttl=\"1m\"/>", server.uri());

    for _ in 0..3 {
        let processed = process(&processor, &request(HeaderMap::new()), page.clone()).await;
        assert_eq!(processed.body, Bytes::from("SALE"));
    }
    assert_eq!(processor.metrics().get_stats().fragment_cache_hits, 2);
}
