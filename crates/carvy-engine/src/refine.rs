//! Background removal and alpha refinement.
//!
//! Raw bytes are decoded to RGBA, matted by a [`MattingBackend`] with the
//! fixed [`MattingParams::VEHICLE_DETAIL`] tuning, the alpha channel alone
//! gets a contrast boost, and the result is re-encoded as a fast PNG.

use std::io::Cursor;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Context};
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder, ImageFormat, Rgba, RgbaImage};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use tracing::{debug, info};

use crate::config::RembgConfig;
use crate::error::RefineError;
use crate::support::{error_chain_text, truncate_text, untimed_http_client};

pub const ALPHA_CONTRAST_FACTOR: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MattingParams {
    pub alpha_matting: bool,
    /// Out of the 0-255 range on purpose: the backend reads it as "very strict".
    pub foreground_threshold: u16,
    pub background_threshold: u16,
    pub erode_size: u32,
}

impl MattingParams {
    /// Small erosion keeps mirrors, antennae and wheel spokes intact.
    pub const VEHICLE_DETAIL: Self = Self {
        alpha_matting: true,
        foreground_threshold: 270,
        background_threshold: 20,
        erode_size: 2,
    };
}

pub trait MattingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Backends whose session cannot run inference concurrently return
    /// false and get serialized by the refiner.
    fn supports_concurrent_inference(&self) -> bool {
        true
    }

    fn remove_background(
        &self,
        image: &RgbaImage,
        params: &MattingParams,
    ) -> anyhow::Result<RgbaImage>;
}

pub struct BackgroundRefiner {
    backend: Box<dyn MattingBackend>,
    params: MattingParams,
    inference_lock: Option<Mutex<()>>,
}

static SHARED_REFINER: OnceLock<Arc<BackgroundRefiner>> = OnceLock::new();

/// Process-wide refiner. `init` runs only for the first caller; later
/// callers get the same session.
pub fn init_shared_refiner<F>(init: F) -> anyhow::Result<Arc<BackgroundRefiner>>
where
    F: FnOnce() -> anyhow::Result<BackgroundRefiner>,
{
    if let Some(existing) = SHARED_REFINER.get() {
        return Ok(Arc::clone(existing));
    }
    let refiner = Arc::new(init()?);
    info!(backend = refiner.backend_name(), "matting session initialized");
    let _ = SHARED_REFINER.set(Arc::clone(&refiner));
    Ok(SHARED_REFINER.get().cloned().unwrap_or(refiner))
}

impl BackgroundRefiner {
    pub fn new(backend: Box<dyn MattingBackend>) -> Self {
        let inference_lock = if backend.supports_concurrent_inference() {
            None
        } else {
            Some(Mutex::new(()))
        };
        Self {
            backend,
            params: MattingParams::VEHICLE_DETAIL,
            inference_lock,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn refine(&self, raw: &[u8]) -> Result<Vec<u8>, RefineError> {
        let input = image::load_from_memory(raw)
            .map_err(|err| RefineError::Decode(err.to_string()))?
            .to_rgba8();
        debug!(
            width = input.width(),
            height = input.height(),
            backend = self.backend.name(),
            "running background removal"
        );

        let mut matted = self.run_backend(&input)?;
        boost_alpha_contrast(&mut matted, ALPHA_CONTRAST_FACTOR);
        let encoded = encode_png_fast(&matted)?;
        debug!(bytes = encoded.len(), "refined png encoded");
        Ok(encoded)
    }

    fn run_backend(&self, input: &RgbaImage) -> Result<RgbaImage, RefineError> {
        let _guard = match &self.inference_lock {
            Some(lock) => Some(
                lock.lock()
                    .map_err(|_| RefineError::Backend("matting session lock poisoned".to_string()))?,
            ),
            None => None,
        };
        self.backend
            .remove_background(input, &self.params)
            .map_err(|err| RefineError::Backend(error_chain_text(&err, 512)))
    }
}

/// Contrast enhancement on the alpha channel only.
///
/// The pivot is the mean alpha rounded half-up; each value moves away from
/// it by `factor`, truncated and clamped to 0..=255.
pub fn boost_alpha_contrast(image: &mut RgbaImage, factor: f32) {
    let count = u64::from(image.width()) * u64::from(image.height());
    if count == 0 {
        return;
    }
    let sum: u64 = image.pixels().map(|pixel| u64::from(pixel[3])).sum();
    let mean = (sum as f64 / count as f64 + 0.5) as i32;
    let pivot = mean as f32;
    for pixel in image.pixels_mut() {
        let value = pivot + factor * (f32::from(pixel[3]) - pivot);
        pixel[3] = if value <= 0.0 {
            0
        } else if value >= 255.0 {
            255
        } else {
            value as u8
        };
    }
}

fn encode_png_fast(image: &RgbaImage) -> Result<Vec<u8>, RefineError> {
    let mut out = Vec::new();
    let encoder =
        PngEncoder::new_with_quality(&mut out, CompressionType::Fast, PngFilterType::Adaptive);
    encoder
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgba8,
        )
        .map_err(|err| RefineError::Encode(err.to_string()))?;
    Ok(out)
}

const MASK_BYTE_MAX: u16 = 255;

/// Client for a rembg HTTP server (`rembg s`), which owns the model session.
pub struct RembgHttpBackend {
    endpoint: String,
    model_name: String,
    concurrent: bool,
    http: HttpClient,
}

impl RembgHttpBackend {
    pub fn new(config: &RembgConfig) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: format!("{}/api/remove", config.url.trim_end_matches('/')),
            model_name: config.model_name.clone(),
            concurrent: config.concurrent,
            http: untimed_http_client()?,
        })
    }

    /// Text fields of the `/api/remove` form.
    ///
    /// The server bounds both thresholds to one mask byte. The trimap marks
    /// pixels strictly above the foreground threshold, so every value at or
    /// above 255 selects the same (empty) certain-foreground set and clamps
    /// without changing the matte.
    fn form_fields(&self, params: &MattingParams) -> Vec<(&'static str, String)> {
        vec![
            ("model", self.model_name.clone()),
            ("a", params.alpha_matting.to_string()),
            ("af", params.foreground_threshold.min(MASK_BYTE_MAX).to_string()),
            ("ab", params.background_threshold.min(MASK_BYTE_MAX).to_string()),
            ("ae", params.erode_size.to_string()),
        ]
    }

    fn form(&self, png: Vec<u8>, params: &MattingParams) -> anyhow::Result<MultipartForm> {
        let file = MultipartPart::bytes(png)
            .file_name("input.png")
            .mime_str("image/png")
            .context("invalid multipart mime")?;
        Ok(self
            .form_fields(params)
            .into_iter()
            .fold(MultipartForm::new().part("file", file), |form, (name, value)| {
                form.text(name, value)
            }))
    }
}

impl MattingBackend for RembgHttpBackend {
    fn name(&self) -> &str {
        "rembg"
    }

    fn supports_concurrent_inference(&self) -> bool {
        self.concurrent
    }

    fn remove_background(
        &self,
        image: &RgbaImage,
        params: &MattingParams,
    ) -> anyhow::Result<RgbaImage> {
        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, ImageFormat::Png)
            .context("failed to encode matting input")?;
        let response = self
            .http
            .post(&self.endpoint)
            .multipart(self.form(png.into_inner(), params)?)
            .send()
            .with_context(|| format!("rembg request failed ({})", self.endpoint))?;
        let status = response.status();
        let body = response.bytes().context("rembg response body read failed")?;
        if !status.is_success() {
            bail!(
                "rembg request failed ({}): {}",
                status.as_u16(),
                truncate_text(&String::from_utf8_lossy(&body), 512)
            );
        }
        let decoded = image::load_from_memory(&body).context("rembg returned a non-image body")?;
        Ok(decoded.to_rgba8())
    }
}

/// Offline stand-in that keys out the color of the top-left pixel.
pub struct CornerKeyMatting;

impl MattingBackend for CornerKeyMatting {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn remove_background(
        &self,
        image: &RgbaImage,
        params: &MattingParams,
    ) -> anyhow::Result<RgbaImage> {
        let Some(key) = image.pixels().next().copied() else {
            return Ok(image.clone());
        };
        let cutoff = i32::from(params.background_threshold);
        let mut out = image.clone();
        for pixel in out.pixels_mut() {
            let distance = (0..3)
                .map(|idx| (i32::from(pixel[idx]) - i32::from(key[idx])).abs())
                .max()
                .unwrap_or(0);
            let alpha = if distance <= cutoff {
                0
            } else {
                ((distance - cutoff) * 4).min(255)
            };
            *pixel = Rgba([pixel[0], pixel[1], pixel[2], alpha as u8]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use image::{ColorType, Rgba, RgbaImage};

    use super::*;

    fn png_bytes(image: &RgbaImage) -> anyhow::Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png)?;
        Ok(buffer.into_inner())
    }

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 7) as u8, (y * 11) as u8, 90, ((x + y) * 13 % 256) as u8])
        })
    }

    struct Passthrough {
        calls: AtomicUsize,
        seen: Mutex<Vec<MattingParams>>,
    }

    impl Passthrough {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl MattingBackend for Arc<Passthrough> {
        fn name(&self) -> &str {
            "passthrough"
        }

        fn remove_background(
            &self,
            image: &RgbaImage,
            params: &MattingParams,
        ) -> anyhow::Result<RgbaImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(*params);
            }
            Ok(image.clone())
        }
    }

    struct Broken;

    impl MattingBackend for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn remove_background(&self, _: &RgbaImage, _: &MattingParams) -> anyhow::Result<RgbaImage> {
            bail!("model session crashed")
        }
    }

    struct SingleSession {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MattingBackend for Arc<SingleSession> {
        fn name(&self) -> &str {
            "single"
        }

        fn supports_concurrent_inference(&self) -> bool {
            false
        }

        fn remove_background(
            &self,
            image: &RgbaImage,
            _: &MattingParams,
        ) -> anyhow::Result<RgbaImage> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(15));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(image.clone())
        }
    }

    #[test]
    fn refine_outputs_rgba_png_with_same_dimensions() -> anyhow::Result<()> {
        let refiner = BackgroundRefiner::new(Box::new(Arc::new(Passthrough::new())));
        let refined = refiner.refine(&png_bytes(&gradient(24, 16))?)?;

        assert_eq!(image::guess_format(&refined)?, ImageFormat::Png);
        let decoded = image::load_from_memory(&refined)?;
        assert_eq!(decoded.color(), ColorType::Rgba8);
        assert_eq!((decoded.width(), decoded.height()), (24, 16));
        Ok(())
    }

    #[test]
    fn refine_is_deterministic() -> anyhow::Result<()> {
        let refiner = BackgroundRefiner::new(Box::new(CornerKeyMatting));
        let raw = png_bytes(&gradient(32, 32))?;
        assert_eq!(refiner.refine(&raw)?, refiner.refine(&raw)?);
        Ok(())
    }

    #[test]
    fn refine_passes_vehicle_detail_tuning() -> anyhow::Result<()> {
        let backend = Arc::new(Passthrough::new());
        let refiner = BackgroundRefiner::new(Box::new(Arc::clone(&backend)));
        refiner.refine(&png_bytes(&gradient(4, 4))?)?;

        let seen = backend
            .seen
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert_eq!(seen.as_slice(), &[MattingParams::VEHICLE_DETAIL]);
        assert_eq!(seen[0].foreground_threshold, 270);
        assert_eq!(seen[0].background_threshold, 20);
        assert_eq!(seen[0].erode_size, 2);
        assert!(seen[0].alpha_matting);
        Ok(())
    }

    fn rembg_backend(url: String) -> anyhow::Result<RembgHttpBackend> {
        RembgHttpBackend::new(&RembgConfig {
            url,
            model_name: "u2net".to_string(),
            concurrent: true,
        })
    }

    fn form_value(body: &str, name: &str) -> Option<String> {
        let marker = format!("name=\"{name}\"\r\n\r\n");
        let start = body.find(&marker)? + marker.len();
        let end = body[start..].find("\r\n")?;
        Some(body[start..start + end].to_string())
    }

    #[test]
    fn rembg_form_keeps_thresholds_within_mask_range() -> anyhow::Result<()> {
        let backend = rembg_backend("http://127.0.0.1:7000".to_string())?;
        let fields = backend.form_fields(&MattingParams::VEHICLE_DETAIL);
        assert_eq!(
            fields,
            vec![
                ("model", "u2net".to_string()),
                ("a", "true".to_string()),
                ("af", "255".to_string()),
                ("ab", "20".to_string()),
                ("ae", "2".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn rembg_backend_posts_file_and_tuning_fields() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let matted = png_bytes(&gradient(4, 4))?;
        let reply = matted.clone();
        let server = thread::spawn(move || -> anyhow::Result<String> {
            let (mut stream, _) = listener.accept()?;
            stream.set_read_timeout(Some(Duration::from_secs(5)))?;
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let read = match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(read) => read,
                };
                request.extend_from_slice(&chunk[..read]);
                if request.ends_with(b"--\r\n") || request.ends_with(b"0\r\n\r\n") {
                    break;
                }
            }
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                reply.len()
            )?;
            stream.write_all(&reply)?;
            Ok(String::from_utf8_lossy(&request).into_owned())
        });

        let backend = rembg_backend(format!("http://{addr}/"))?;
        let out = backend.remove_background(&gradient(4, 4), &MattingParams::VEHICLE_DETAIL)?;
        let request = server
            .join()
            .map_err(|_| anyhow::anyhow!("capture thread panicked"))??;

        assert!(request.starts_with("POST /api/remove "));
        assert!(request.contains("name=\"file\"; filename=\"input.png\""));
        assert_eq!(form_value(&request, "model").as_deref(), Some("u2net"));
        assert_eq!(form_value(&request, "a").as_deref(), Some("true"));
        assert_eq!(form_value(&request, "af").as_deref(), Some("255"));
        assert_eq!(form_value(&request, "ab").as_deref(), Some("20"));
        assert_eq!(form_value(&request, "ae").as_deref(), Some("2"));
        assert_eq!(out, image::load_from_memory(&matted)?.to_rgba8());
        Ok(())
    }

    #[test]
    fn refine_rejects_malformed_input() {
        let backend = Arc::new(Passthrough::new());
        let refiner = BackgroundRefiner::new(Box::new(Arc::clone(&backend)));
        let result = refiner.refine(b"definitely not an image");
        assert!(matches!(result, Err(RefineError::Decode(_))));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refine_surfaces_backend_failure() -> anyhow::Result<()> {
        let refiner = BackgroundRefiner::new(Box::new(Broken));
        match refiner.refine(&png_bytes(&gradient(4, 4))?) {
            Err(RefineError::Backend(message)) => assert!(message.contains("crashed")),
            other => panic!("expected backend error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn alpha_contrast_pivots_on_rounded_mean() {
        let alphas = [0u8, 100, 200, 255];
        let mut image = RgbaImage::from_fn(4, 1, |x, _| Rgba([10, 20, 30, alphas[x as usize]]));
        boost_alpha_contrast(&mut image, ALPHA_CONTRAST_FACTOR);

        let boosted: Vec<u8> = image.pixels().map(|pixel| pixel[3]).collect();
        assert_eq!(boosted, vec![0, 61, 255, 255]);
        assert!(image.pixels().all(|pixel| pixel[0] == 10 && pixel[1] == 20 && pixel[2] == 30));
    }

    #[test]
    fn alpha_contrast_leaves_uniform_alpha_alone() {
        let mut image = RgbaImage::from_pixel(3, 3, Rgba([1, 2, 3, 128]));
        boost_alpha_contrast(&mut image, ALPHA_CONTRAST_FACTOR);
        assert!(image.pixels().all(|pixel| pixel[3] == 128));
    }

    #[test]
    fn corner_key_clears_backdrop_and_keeps_subject() -> anyhow::Result<()> {
        let image = RgbaImage::from_fn(10, 10, |x, y| {
            if (3..7).contains(&x) && (3..7).contains(&y) {
                Rgba([20, 40, 160, 255])
            } else {
                Rgba([211, 211, 211, 255])
            }
        });
        let matted = CornerKeyMatting.remove_background(&image, &MattingParams::VEHICLE_DETAIL)?;
        assert_eq!(matted.get_pixel(0, 0)[3], 0);
        assert_eq!(matted.get_pixel(5, 5)[3], 255);
        Ok(())
    }

    #[test]
    fn single_session_backend_is_serialized() -> anyhow::Result<()> {
        let backend = Arc::new(SingleSession {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let refiner = Arc::new(BackgroundRefiner::new(Box::new(Arc::clone(&backend))));
        let raw = Arc::new(png_bytes(&gradient(8, 8))?);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let refiner = Arc::clone(&refiner);
                let raw = Arc::clone(&raw);
                thread::spawn(move || refiner.refine(&raw).map(|bytes| bytes.len()))
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("refine thread panicked"))??;
        }
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn shared_refiner_initializes_once() -> anyhow::Result<()> {
        let first = init_shared_refiner(|| Ok(BackgroundRefiner::new(Box::new(CornerKeyMatting))))?;
        let second = init_shared_refiner(|| bail!("second init must not run"))?;
        assert!(Arc::ptr_eq(&first, &second));
        Ok(())
    }
}
