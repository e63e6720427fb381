use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::blocking::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Media types beginning with this prefix pass the intake gate.
const IMAGE_MIME_PREFIX: &str = "image/";

/// Returns true when the declared media type indicates an image.
///
/// This is the only validation intake performs: no size, dimension or
/// decodability checks.
pub fn is_image_mime(mime: &str) -> bool {
    mime.starts_with(IMAGE_MIME_PREFIX)
}

/// Guess a media type from a file extension, for platforms where no
/// declared type accompanies a picked or dropped file.
pub fn mime_for_path(path: impl AsRef<Path>) -> Option<&'static str> {
    let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

/// The image currently held for prediction.
///
/// Replaced wholesale on each accepted selection; never persisted. The
/// preview URI is derived once at construction so a display surface can
/// render it without touching the raw bytes again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    name: String,
    mime: String,
    bytes: Vec<u8>,
    preview_uri: String,
}

impl SelectedFile {
    /// Builds a selection from raw bytes and a declared media type.
    ///
    /// Returns `None` for anything that is not an image; callers treat
    /// that as a silent no-op and keep whatever was selected before.
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Option<Self> {
        let name = name.into();
        let mime = mime.into();
        if !is_image_mime(&mime) {
            tracing::debug!("ignoring non-image selection {name} ({mime})");
            return None;
        }
        let preview_uri = format!("data:{};base64,{}", mime, BASE64.encode(&bytes));
        Some(Self {
            name,
            mime,
            bytes,
            preview_uri,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Renderable `data:` URI for the selected image.
    pub fn preview_uri(&self) -> &str {
        &self.preview_uri
    }
}

/// Owner of the currently selected file.
///
/// Selections load asynchronously, so each one is stamped with a
/// generation; a load that finishes after a newer selection started is
/// discarded instead of racing for the last write.
#[derive(Debug, Default)]
pub struct IntakeState {
    generation: u64,
    current: Option<SelectedFile>,
}

impl IntakeState {
    /// Starts a selection for the given declared media type.
    ///
    /// Non-image types are dropped silently and leave the prior selection
    /// untouched. For images, returns the generation stamp the eventual
    /// [`complete_selection`](Self::complete_selection) must carry.
    pub fn offer(&mut self, mime: &str) -> Option<u64> {
        if !is_image_mime(mime) {
            tracing::debug!("intake ignored non-image type {mime}");
            return None;
        }
        self.generation += 1;
        Some(self.generation)
    }

    /// Applies a finished load if its generation is still the latest.
    ///
    /// Returns whether the file was accepted as the current selection.
    pub fn complete_selection(&mut self, generation: u64, file: SelectedFile) -> bool {
        if generation != self.generation {
            tracing::debug!(
                "discarding stale selection {} (generation {generation}, latest {})",
                file.name(),
                self.generation
            );
            return false;
        }
        self.current = Some(file);
        true
    }

    pub fn selected(&self) -> Option<&SelectedFile> {
        self.current.as_ref()
    }

    /// Submit is possible iff a valid image has been accepted.
    pub fn can_submit(&self) -> bool {
        self.current.is_some()
    }
}

/// Busy/idle state of the submit control.
///
/// The busy state is the only mutual exclusion around the prediction
/// request: while busy the control is disabled, so at most one request is
/// in flight. Idle is both the initial state and the only state reachable
/// after a request completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubmitState {
    #[default]
    Idle,
    Busy,
}

impl SubmitState {
    pub fn is_busy(self) -> bool {
        self == SubmitState::Busy
    }

    /// Idle → Busy. Returns false when a request is already in flight.
    pub fn begin(&mut self) -> bool {
        if self.is_busy() {
            return false;
        }
        *self = SubmitState::Busy;
        true
    }

    /// Busy → Idle. Runs on every completion, success or failure.
    pub fn finish(&mut self) {
        *self = SubmitState::Idle;
    }
}

/// Response payload of the prediction endpoint. Extra fields are
/// tolerated; these two are required.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Prediction {
    pub class_name: String,
    pub confidence: f32,
}

/// Failure modes of one prediction attempt.
///
/// All of these surface to the user as the same generic message; the
/// distinction exists for the diagnostic log and for tests.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("prediction request failed")]
    Transport(#[source] reqwest::Error),
    #[error("prediction response was not valid JSON")]
    Malformed(#[source] serde_json::Error),
    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceRange(f32),
}

/// Parses a response body into a [`Prediction`].
pub fn parse_prediction(body: &[u8]) -> Result<Prediction, PredictError> {
    let prediction: Prediction = serde_json::from_slice(body).map_err(PredictError::Malformed)?;
    if !(0.0..=1.0).contains(&prediction.confidence) {
        return Err(PredictError::ConfidenceRange(prediction.confidence));
    }
    Ok(prediction)
}

/// Formats a confidence in [0,1] as a percentage with two decimals.
pub fn format_confidence(confidence: f32) -> String {
    format!("{:.2}%", confidence * 100.0)
}

/// Blocking client for the remote classification endpoint.
///
/// One best-effort attempt per call: no retry, no client-side timeout
/// beyond the transport defaults. Call from a worker thread when a UI
/// loop must stay responsive.
pub struct PredictionClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl PredictionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::blocking::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/predict", self.base_url.trim_end_matches('/'))
    }

    /// Submits the selected image as a multipart form with one part named
    /// `image` and parses the JSON response.
    ///
    /// The body is parsed regardless of HTTP status; a malformed body on
    /// any status hits the same failure path.
    pub fn predict(&self, file: &SelectedFile) -> Result<Prediction, PredictError> {
        let part = Part::bytes(file.bytes().to_vec())
            .file_name(file.name().to_owned())
            .mime_str(file.mime())
            .map_err(PredictError::Transport)?;
        let form = Form::new().part("image", part);
        let response = self
            .http
            .post(self.endpoint())
            .multipart(form)
            .send()
            .map_err(PredictError::Transport)?;
        let body = response.bytes().map_err(PredictError::Transport)?;
        parse_prediction(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

    #[rstest]
    #[case("image/png", true)]
    #[case("image/jpeg", true)]
    #[case("image/svg+xml", true)]
    #[case("text/plain", false)]
    #[case("application/octet-stream", false)]
    #[case("", false)]
    fn image_mime_gate(#[case] mime: &str, #[case] accepted: bool) {
        assert_eq!(is_image_mime(mime), accepted);
    }

    #[rstest]
    #[case("photo.png", Some("image/png"))]
    #[case("photo.JPG", Some("image/jpeg"))]
    #[case("photo.jpeg", Some("image/jpeg"))]
    #[case("anim.gif", Some("image/gif"))]
    #[case("notes.txt", None)]
    #[case("no_extension", None)]
    fn mime_guessed_from_extension(#[case] name: &str, #[case] expected: Option<&str>) {
        assert_eq!(mime_for_path(name), expected);
    }

    #[test]
    fn selected_file_rejects_non_image() {
        assert!(SelectedFile::new("notes.txt", "text/plain", b"hello".to_vec()).is_none());
    }

    #[test]
    fn selected_file_preview_is_data_uri() {
        let file = SelectedFile::new("photo.png", "image/png", PNG_MAGIC.to_vec()).unwrap();
        let uri = file.preview_uri();
        assert!(uri.starts_with("data:image/png;base64,"));
        let payload = uri.rsplit(',').next().unwrap();
        let decoded = BASE64.decode(payload).unwrap();
        assert_eq!(decoded, PNG_MAGIC);
    }

    #[test]
    fn intake_ignores_non_image_and_keeps_prior_selection() {
        let mut intake = IntakeState::default();
        assert!(!intake.can_submit());

        assert_eq!(intake.offer("text/plain"), None);
        assert!(!intake.can_submit());

        let generation = intake.offer("image/png").unwrap();
        let file = SelectedFile::new("photo.png", "image/png", PNG_MAGIC.to_vec()).unwrap();
        assert!(intake.complete_selection(generation, file.clone()));
        assert!(intake.can_submit());
        assert_eq!(intake.selected(), Some(&file));

        // A later non-image offer must not disturb the accepted selection.
        assert_eq!(intake.offer("text/plain"), None);
        assert_eq!(intake.selected(), Some(&file));
    }

    #[test]
    fn stale_selection_is_discarded_by_generation_guard() {
        let mut intake = IntakeState::default();
        let first = intake.offer("image/png").unwrap();
        let second = intake.offer("image/jpeg").unwrap();
        assert!(first < second);

        // The first read finishes after the second selection started.
        let early = SelectedFile::new("a.png", "image/png", b"aaaa".to_vec()).unwrap();
        assert!(!intake.complete_selection(first, early));
        assert!(!intake.can_submit());

        let late = SelectedFile::new("b.jpg", "image/jpeg", b"bbbb".to_vec()).unwrap();
        assert!(intake.complete_selection(second, late.clone()));
        assert_eq!(intake.selected(), Some(&late));
    }

    #[test]
    fn submit_state_goes_idle_busy_idle_exactly_once() {
        let mut submit = SubmitState::default();
        assert!(!submit.is_busy());

        assert!(submit.begin());
        assert!(submit.is_busy());
        // Re-entrant trigger while busy is refused.
        assert!(!submit.begin());

        submit.finish();
        assert!(!submit.is_busy());
        // Idle again: the next request may start.
        assert!(submit.begin());
    }

    #[test]
    fn parse_prediction_reads_label_and_confidence() {
        let body = br#"{"class_name": "cat", "confidence": 0.9231}"#;
        let prediction = parse_prediction(body).unwrap();
        assert_eq!(prediction.class_name, "cat");
        assert_eq!(format_confidence(prediction.confidence), "92.31%");
    }

    #[test]
    fn parse_prediction_tolerates_extra_fields() {
        let body = br#"{"class_name": "dog", "confidence": 0.5, "model": "efficientnet"}"#;
        assert_eq!(parse_prediction(body).unwrap().class_name, "dog");
    }

    #[rstest]
    #[case(br#"not json"# as &[u8])]
    #[case(br#"{"confidence": 0.5}"#)]
    #[case(br#"{"class_name": "cat"}"#)]
    #[case(br#"[]"#)]
    fn parse_prediction_flags_malformed_bodies(#[case] body: &[u8]) {
        assert!(matches!(
            parse_prediction(body),
            Err(PredictError::Malformed(_))
        ));
    }

    #[rstest]
    #[case(br#"{"class_name": "cat", "confidence": 1.5}"# as &[u8], 1.5)]
    #[case(br#"{"class_name": "cat", "confidence": -0.1}"#, -0.1)]
    fn parse_prediction_flags_out_of_range_confidence(#[case] body: &[u8], #[case] value: f32) {
        match parse_prediction(body) {
            Err(PredictError::ConfidenceRange(c)) => assert_eq!(c, value),
            other => panic!("expected ConfidenceRange, got {other:?}"),
        }
    }

    #[rstest]
    #[case(0.0, "0.00%")]
    #[case(1.0, "100.00%")]
    #[case(0.9231, "92.31%")]
    #[case(0.005, "0.50%")]
    fn confidence_formats_as_two_decimal_percentage(#[case] value: f32, #[case] expected: &str) {
        assert_eq!(format_confidence(value), expected);
    }

    #[test]
    fn endpoint_joins_base_url_without_double_slash() {
        assert_eq!(
            PredictionClient::new("http://127.0.0.1:5000/").endpoint(),
            "http://127.0.0.1:5000/predict"
        );
        assert_eq!(
            PredictionClient::new("http://127.0.0.1:5000").endpoint(),
            "http://127.0.0.1:5000/predict"
        );
    }
}
