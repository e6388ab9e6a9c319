use bytes::Bytes;
use http::{HeaderMap, Method};
use pingora_esi::models::{DataTag, DataTags};
use pingora_esi::{
    inject_content, CancelSignal, EsiConfig, EsiError, EsiProcessor, HandlerRegistry, PageCache,
    RequestInfo, ResponsePlan, StreamInjector,
};

#[test]
fn test_backend_failures_trip_breaker() {
    assert!(EsiError::Timeout("t".into()).trips_breaker());
    assert!(EsiError::HttpError("h".into()).trips_breaker());
    assert!(EsiError::ResourceNotFound("k".into()).trips_breaker());
    assert!(EsiError::IoError("io".into()).trips_breaker());
    assert!(EsiError::BackendFatal("b".into()).trips_breaker());
}

#[test]
fn test_caller_side_errors_do_not_trip_breaker() {
    assert!(!EsiError::Cancelled("c".into()).trips_breaker());
    assert!(!EsiError::NotSupported("n".into()).trips_breaker());
    assert!(!EsiError::ConfigError("c".into()).trips_breaker());
    assert!(!EsiError::ParseError("p".into()).trips_breaker());
}

#[test]
fn test_status_mapping() {
    assert_eq!(EsiError::HttpError("x".into()).to_http_status(), 502);
    assert_eq!(EsiError::Timeout("x".into()).to_http_status(), 504);
    assert_eq!(EsiError::Cancelled("x".into()).to_http_status(), 499);
    assert_eq!(
        EsiError::MalformedTag {
            offset: 0,
            max_size: 16
        }
        .to_http_status(),
        500
    );
}

#[test]
fn test_from_http_status() {
    assert!(matches!(
        EsiError::from_http_status(404, "gone"),
        EsiError::ResourceNotFound(_)
    ));
    assert!(matches!(
        EsiError::from_http_status(500, "boom"),
        EsiError::HttpError(_)
    ));
}

#[test]
fn test_fallback_content() {
    let err = EsiError::AllResourcesFailed {
        tag: "include src=\"a\"".into(),
        attempts: 2,
        on_error: Some("sorry".into()),
    };
    assert_eq!(err.fallback_content(), Some("sorry"));
    assert_eq!(EsiError::Timeout("x".into()).fallback_content(), None);
}

#[test]
fn test_injection_past_end_is_error() {
    let tags = DataTags::new(vec![DataTag::new(4, 40, "x").unwrap()]).unwrap();
    let err = inject_content(b"short", &tags).unwrap_err();
    assert!(matches!(err, EsiError::InjectionError { index: 0, .. }));
}

#[test]
fn test_truncated_stream_is_error() {
    let tags = DataTags::new(vec![DataTag::new(2, 10, "x").unwrap()]).unwrap();
    let mut injector = StreamInjector::new(tags);
    injector.write(b"abcd").unwrap();
    assert!(matches!(
        injector.finish(),
        Err(EsiError::InjectionError { .. })
    ));
}

#[test]
fn test_pending_plan_has_no_headers() {
    let plan = ResponsePlan::pending(HeaderMap::new());
    assert!(plan.response_headers().is_err());
    assert!(plan.into_injector().is_err());
}

#[tokio::test]
async fn test_oversized_tag_degrades_page() {
    let mut config = EsiConfig::default();
    config.max_tag_size = 32;
    let processor = EsiProcessor::new(config, HandlerRegistry::new());
    let body = Bytes::from(format!(
        "before <esi:include src=\"{}\"/> after",
        "x".repeat(64)
    ));

    let req = RequestInfo::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());
    let page = processor
        .process_document(&req, &HeaderMap::new(), body.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert!(page.degraded);
    assert_eq!(page.body, body);
    assert_eq!(processor.page_cache().len(), 0);
}

#[tokio::test]
async fn test_binary_body_untouched() {
    let processor = EsiProcessor::new(EsiConfig::default(), HandlerRegistry::new());
    let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
    png.extend_from_slice(b"<esi:include src=\"a\"/>");
    let body = Bytes::from(png);

    let req = RequestInfo::new(Method::GET, "/logo.png".parse().unwrap(), HeaderMap::new());
    let page = processor
        .process_document(&req, &HeaderMap::new(), body.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(page.body, body);
    assert!(!page.degraded);
    assert_eq!(page.tags, 0);
}

#[test]
fn test_invalid_config_rejected_by_processor() {
    let mut config = EsiConfig::default();
    config.max_failures = 0;
    assert!(matches!(
        EsiProcessor::from_config(config),
        Err(EsiError::ConfigError(_))
    ));
}
