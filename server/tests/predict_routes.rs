use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use sms_spam::{
    classifier::{ClassifyError, SpamClassifier},
    LoadedModel, SequenceEncoder, SpamService, Truncation, Vocabulary,
};
use sms_spam_server::{create_router, AppState};
use tower::ServiceExt;

/// Calls everything with "kazandınız" a spam.
struct KeywordClassifier {
    spam_id: i64,
}

impl SpamClassifier for KeywordClassifier {
    fn spam_probability(
        &self,
        sequence: &sms_spam::EncodedSequence,
    ) -> Result<f32, ClassifyError> {
        Ok(if sequence.ids().contains(&self.spam_id) {
            0.93
        } else {
            0.04
        })
    }
}

struct Failing;

impl SpamClassifier for Failing {
    fn spam_probability(
        &self,
        _sequence: &sms_spam::EncodedSequence,
    ) -> Result<f32, ClassifyError> {
        Err(ClassifyError::Backend {
            message: "tensor exploded".into(),
        })
    }
}

fn encoder() -> SequenceEncoder {
    let vocabulary = Vocabulary::fit([
        "tebrikler 1000 tl kazandınız",
        "akşam yemeğine gelir misin",
    ]);
    SequenceEncoder::new(vocabulary, 51, Truncation::Pre)
}

fn router_with(classifier: Box<dyn SpamClassifier>) -> Router {
    let model = LoadedModel {
        encoder: encoder(),
        classifier,
    };
    create_router(AppState::new(SpamService::new(model)))
}

fn keyword_router() -> Router {
    let spam_id = encoder().vocabulary().id("kazandınız").expect("fitted");
    router_with(Box::new(KeywordClassifier { spam_id }))
}

async fn post_predict(router: Router, body: &str) -> (StatusCode, Value) {
    let response = router
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/predict")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_owned()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn spam_is_detected() {
    let (status, body) = post_predict(
        keyword_router(),
        r#"{"message": "TEBRİKLER! 1000 TL kazandınız! Hemen tıklayın!"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_spam"], json!(true));
    let prediction = body["prediction"].as_f64().unwrap();
    assert!((prediction - 0.93).abs() < 1e-6);
}

#[tokio::test]
async fn normal_message() {
    let (status, body) =
        post_predict(keyword_router(), r#"{"message": "Akşam yemeğine gelir misin?"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_spam"], json!(false));
    assert!(body["prediction"].as_f64().unwrap() < 0.5);
}

#[tokio::test]
async fn empty_message_is_a_bad_request() {
    for request in [r#"{"message": ""}"#, "{}", r#"{"message": null}"#] {
        let (status, body) = post_predict(keyword_router(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{request}");
        assert_eq!(body, json!({"error": "Mesaj boş olamaz"}));
    }
}

#[tokio::test]
async fn empty_message_wins_over_missing_model() {
    let router = create_router(AppState::new(SpamService::unloaded()));
    let (status, body) = post_predict(router, r#"{"message": ""}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Mesaj boş olamaz");
}

#[tokio::test]
async fn unloaded_model() {
    let router = create_router(AppState::new(SpamService::unloaded()));
    let (status, body) = post_predict(router, r#"{"message": "Merhaba"}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"error": "Model yüklenmedi"}));
}

#[tokio::test]
async fn classifier_failure() {
    let (status, body) = post_predict(router_with(Box::new(Failing)), r#"{"message": "selam"}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"error": "tensor exploded"}));
}

#[tokio::test]
async fn malformed_json() {
    let (status, body) = post_predict(keyword_router(), "{not json").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().is_some_and(|error| !error.is_empty()));
}

#[tokio::test]
async fn body_without_json_content_type() {
    for content_type in [Some("text/plain"), None] {
        let mut request = Request::builder().method(Method::POST).uri("/predict");
        if let Some(content_type) = content_type {
            request = request.header(header::CONTENT_TYPE, content_type);
        }
        let response = keyword_router()
            .oneshot(
                request
                    .body(Body::from(r#"{"message": "Merhaba"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            StatusCode::INTERNAL_SERVER_ERROR,
            "{content_type:?}"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"]
            .as_str()
            .is_some_and(|error| error.contains("application/json")));
    }
}

#[tokio::test]
async fn index_page() {
    let response = keyword_router()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_owned();
    assert!(content_type.starts_with("text/html"));
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let page = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(page.contains("/predict"));
}

#[tokio::test]
async fn predict_requires_post() {
    let response = keyword_router()
        .oneshot(Request::builder().uri("/predict").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
