use anyhow::Context as _;
use eframe::{App, Frame, NativeOptions, egui};
use predict_core::{
    IntakeState, PredictError, Prediction, PredictionClient, SelectedFile, SubmitState,
    format_confidence, mime_for_path,
};
use rfd::FileDialog;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;

const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";
const PREVIEW_MAX: egui::Vec2 = egui::Vec2::new(320.0, 240.0);

fn main() {
    tracing_subscriber::fmt::init();
    let options = NativeOptions::default();
    if let Err(e) = eframe::run_native(
        "SnapLabel",
        options,
        Box::new(|_cc| Ok::<_, Box<dyn std::error::Error + Send + Sync>>(Box::new(UiApp::new()))),
    ) {
        eprintln!("Application stopped with error: {e}");
    }
}

/// A finished background file read, stamped with its selection generation.
struct IntakeEvent {
    generation: u64,
    file: SelectedFile,
}

enum FileSource {
    Memory(Vec<u8>),
    Disk(PathBuf),
}

enum ResultView {
    Prediction(Prediction),
    Failed,
}

struct UiApp {
    intake: IntakeState,
    submit: SubmitState,
    server_url: String,
    preview: Option<egui::TextureHandle>,
    result: Option<ResultView>,
    status: String,
    intake_tx: Sender<IntakeEvent>,
    intake_rx: Receiver<IntakeEvent>,
    predict_tx: Sender<Result<Prediction, PredictError>>,
    predict_rx: Receiver<Result<Prediction, PredictError>>,
}

impl UiApp {
    fn new() -> Self {
        let (intake_tx, intake_rx) = channel();
        let (predict_tx, predict_rx) = channel();
        let server_url =
            std::env::var("SNAPLABEL_SERVER").unwrap_or_else(|_| DEFAULT_SERVER.to_string());
        Self {
            intake: IntakeState::default(),
            submit: SubmitState::default(),
            server_url,
            preview: None,
            result: None,
            status: String::new(),
            intake_tx,
            intake_rx,
            predict_tx,
            predict_rx,
        }
    }

    /// Starts a selection: mime gate on the UI thread, file read on a
    /// worker. Non-image types never reach the worker.
    fn begin_selection(
        &mut self,
        name: String,
        mime: String,
        source: FileSource,
        ctx: &egui::Context,
    ) {
        let Some(generation) = self.intake.offer(&mime) else {
            return;
        };
        let tx = self.intake_tx.clone();
        let ctx = ctx.clone();
        thread::spawn(move || {
            let bytes = match source {
                FileSource::Memory(bytes) => Ok(bytes),
                FileSource::Disk(path) => {
                    fs::read(&path).with_context(|| format!("cannot read {}", path.display()))
                }
            };
            match bytes {
                Ok(bytes) => {
                    if let Some(file) = SelectedFile::new(name, mime, bytes) {
                        let _ = tx.send(IntakeEvent { generation, file });
                    }
                }
                Err(e) => tracing::warn!("selection dropped: {e:#}"),
            }
            ctx.request_repaint();
        });
    }

    fn offer_path(&mut self, path: PathBuf, ctx: &egui::Context) {
        let Some(mime) = mime_for_path(&path) else {
            tracing::debug!("ignoring non-image file {}", path.display());
            return;
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.begin_selection(name, mime.to_owned(), FileSource::Disk(path), ctx);
    }

    fn offer_dropped(&mut self, dropped: egui::DroppedFile, ctx: &egui::Context) {
        // Prefer the declared type; fall back to the extension when the
        // platform leaves it empty (native drops usually do).
        let mime = if dropped.mime.is_empty() {
            dropped.path.as_deref().and_then(mime_for_path)
        } else {
            Some(dropped.mime.as_str())
        };
        let Some(mime) = mime.map(str::to_owned) else {
            tracing::debug!("ignoring drop with unknown type ({})", dropped.name);
            return;
        };
        let name = dropped
            .path
            .as_deref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dropped.name.clone());
        match (dropped.bytes, dropped.path) {
            (Some(bytes), _) => {
                self.begin_selection(name, mime, FileSource::Memory(bytes.to_vec()), ctx)
            }
            (None, Some(path)) => self.begin_selection(name, mime, FileSource::Disk(path), ctx),
            (None, None) => tracing::debug!("drop carried neither bytes nor a path"),
        }
    }

    fn drain_intake(&mut self, ctx: &egui::Context) {
        while let Ok(IntakeEvent { generation, file }) = self.intake_rx.try_recv() {
            let texture = decode_preview(ctx, &file);
            let name = file.name().to_owned();
            let mime = file.mime().to_owned();
            if self.intake.complete_selection(generation, file) {
                self.preview = texture;
                self.status = format!("Selected {name} ({mime})");
            }
        }
    }

    /// Draining the predict channel is the guaranteed-cleanup path: the
    /// control returns to idle on every completion, success or failure.
    fn drain_predictions(&mut self) {
        while let Ok(outcome) = self.predict_rx.try_recv() {
            self.submit.finish();
            match outcome {
                Ok(prediction) => {
                    self.result = Some(ResultView::Prediction(prediction));
                }
                Err(e) => {
                    tracing::error!("prediction failed: {e:?}");
                    self.result = Some(ResultView::Failed);
                }
            }
        }
    }

    fn drop_zone(&mut self, ctx: &egui::Context, ui: &mut egui::Ui) {
        let hovering = ctx.input(|i| !i.raw.hovered_files.is_empty());
        let desired = egui::Vec2::new(ui.available_width(), 110.0);
        let (resp, painter) = ui.allocate_painter(desired, egui::Sense::click());
        let r = resp.rect;
        let fill = if hovering {
            egui::Color32::from_rgb(36, 52, 71)
        } else {
            egui::Color32::from_gray(40)
        };
        painter.rect_filled(r, 4.0, fill);
        painter.rect_stroke(
            r,
            4.0,
            egui::Stroke::new(1.0, egui::Color32::DARK_GRAY),
            egui::StrokeKind::Inside,
        );
        painter.text(
            r.center(),
            egui::Align2::CENTER_CENTER,
            "Drop an image here or click to choose one",
            egui::FontId::proportional(14.0),
            ui.visuals().text_color(),
        );

        if resp.clicked()
            && let Some(path) = FileDialog::new()
                .add_filter("Images", &["png", "jpg", "jpeg", "gif", "webp", "bmp"])
                .pick_file()
        {
            self.offer_path(path, ctx);
        }

        // Only the first file of a multi-file drop is considered.
        let dropped = ctx.input(|i| i.raw.dropped_files.clone());
        if let Some(first) = dropped.into_iter().next() {
            self.offer_dropped(first, ctx);
        }
    }

    fn predict_controls(&mut self, ctx: &egui::Context, ui: &mut egui::Ui) {
        let can_predict = self.intake.can_submit() && !self.submit.is_busy();
        let label = if self.submit.is_busy() {
            "Predicting…"
        } else {
            "Predict"
        };
        if ui
            .add_enabled(can_predict, egui::Button::new(label))
            .clicked()
            && let Some(file) = self.intake.selected().cloned()
            && self.submit.begin()
        {
            let client = PredictionClient::new(self.server_url.trim());
            let tx = self.predict_tx.clone();
            let ctx = ctx.clone();
            thread::spawn(move || {
                let outcome = client.predict(&file);
                let _ = tx.send(outcome);
                ctx.request_repaint();
            });
        }
    }

    fn results_area(&self, ui: &mut egui::Ui) {
        match &self.result {
            Some(ResultView::Prediction(p)) => {
                ui.heading("Result");
                ui.label(&p.class_name);
                ui.label(format!("Confidence: {}", format_confidence(p.confidence)));
            }
            Some(ResultView::Failed) => {
                ui.colored_label(
                    ui.visuals().error_fg_color,
                    "Prediction failed, please try again.",
                );
            }
            None => {}
        }
    }
}

fn decode_preview(ctx: &egui::Context, file: &SelectedFile) -> Option<egui::TextureHandle> {
    match image::load_from_memory(file.bytes()) {
        Ok(img) => {
            let rgba = img.to_rgba8();
            let size = [rgba.width() as usize, rgba.height() as usize];
            let pixels = rgba.into_raw();
            let color = egui::ColorImage::from_rgba_unmultiplied(size, &pixels);
            let name = format!("preview:{}", file.name());
            Some(ctx.load_texture(name, color, egui::TextureOptions::LINEAR))
        }
        Err(e) => {
            // Intake validates the declared type only; an undecodable image
            // stays selected, just without a preview.
            tracing::warn!("preview decode failed for {}: {e}", file.name());
            None
        }
    }
}

impl App for UiApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut Frame) {
        self.drain_intake(ctx);
        self.drain_predictions();

        egui::TopBottomPanel::top("top").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label("Server");
                ui.add_enabled(
                    !self.submit.is_busy(),
                    egui::TextEdit::singleline(&mut self.server_url).desired_width(220.0),
                );
                if !self.status.is_empty() {
                    ui.label(&self.status);
                }
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            self.drop_zone(ctx, ui);
            ui.add_space(8.0);

            if let Some(tex) = &self.preview {
                let size = tex.size_vec2();
                let scale = (PREVIEW_MAX.x / size.x).min(PREVIEW_MAX.y / size.y).min(1.0);
                ui.add(egui::Image::new(egui::load::SizedTexture::new(
                    tex.id(),
                    size * scale,
                )));
                ui.add_space(8.0);
            }

            self.predict_controls(ctx, ui);
            ui.add_space(8.0);
            self.results_area(ui);
        });
    }
}
