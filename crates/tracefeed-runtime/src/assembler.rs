use rand::Rng;
use thiserror::Error;

use tracefeed_core::config::TrainingConfig;
use tracefeed_core::sample::{Batch, CropWindow, Frame, FrameError, Sample};

/// Next-state crop centres stay this far from the image border.
const NEXT_STATE_BORDER_PX: usize = 10;

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("cannot assemble an empty batch")]
    Empty,
    #[error("sample {trace_id}: {source}")]
    Frame {
        trace_id: String,
        #[source]
        source: FrameError,
    },
    #[error("sample {trace_id}: {field} has {indexes} indexes but {weights} weights")]
    SymbolLength {
        trace_id: String,
        field: &'static str,
        indexes: usize,
        weights: usize,
    },
}

/// Draw-time cropping and augmentation settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentParams {
    pub crop_current: bool,
    pub crop_next: bool,
    pub crop_width: usize,
    pub crop_height: usize,
    pub next_crop_width: usize,
    pub next_crop_height: usize,
    pub jitter_x: i32,
    pub jitter_y: i32,
    pub pixel_noise: f32,
}

impl AugmentParams {
    pub fn from_config(cfg: &TrainingConfig) -> Self {
        Self {
            crop_current: cfg.enable_image_cropping,
            crop_next: cfg.enable_next_state_image_cropping,
            crop_width: cfg.crop_width,
            crop_height: cfg.crop_height,
            next_crop_width: cfg.next_state_crop_width,
            next_crop_height: cfg.next_state_crop_height,
            jitter_x: cfg.crop_center_random_x_displacement,
            jitter_y: cfg.crop_center_random_y_displacement,
            pixel_noise: cfg.augmentation_pixel_noise,
        }
    }

    pub fn disabled() -> Self {
        Self {
            crop_current: false,
            crop_next: false,
            crop_width: 0,
            crop_height: 0,
            next_crop_width: 0,
            next_crop_height: 0,
            jitter_x: 0,
            jitter_y: 0,
            pixel_noise: 0.0,
        }
    }
}

/// Window of `crop_w x crop_h` centred as close to `(cx, cy)` as the image
/// allows. Crops larger than the image degrade to the full image on that axis.
pub fn crop_window_around(
    cx: i64,
    cy: i64,
    crop_w: usize,
    crop_h: usize,
    width: usize,
    height: usize,
) -> CropWindow {
    let (left, right) = clamp_axis(cx, crop_w, width);
    let (top, bottom) = clamp_axis(cy, crop_h, height);
    CropWindow {
        left,
        top,
        right,
        bottom,
    }
}

fn clamp_axis(center: i64, size: usize, extent: usize) -> (usize, usize) {
    if size == 0 || size >= extent {
        return (0, extent);
    }
    let max_start = (extent - size) as i64;
    let start = (center - (size / 2) as i64).clamp(0, max_start) as usize;
    (start, start + size)
}

/// Current-state window: centred on the action, displaced by bounded jitter.
pub fn current_state_window<R: Rng + ?Sized>(
    sample: &Sample,
    params: &AugmentParams,
    rng: &mut R,
) -> CropWindow {
    let jx = jitter(params.jitter_x, rng);
    let jy = jitter(params.jitter_y, rng);
    crop_window_around(
        i64::from(sample.action_x) + jx,
        i64::from(sample.action_y) + jy,
        params.crop_width,
        params.crop_height,
        sample.image_width(),
        sample.image_height(),
    )
}

/// Next-state window: uniformly random centre kept off the border.
pub fn next_state_window<R: Rng + ?Sized>(
    width: usize,
    height: usize,
    params: &AugmentParams,
    rng: &mut R,
) -> CropWindow {
    let cx = random_center(width, rng);
    let cy = random_center(height, rng);
    crop_window_around(
        cx,
        cy,
        params.next_crop_width,
        params.next_crop_height,
        width,
        height,
    )
}

fn jitter<R: Rng + ?Sized>(max: i32, rng: &mut R) -> i64 {
    if max <= 0 {
        return 0;
    }
    i64::from(rng.gen_range(-max..=max))
}

fn random_center<R: Rng + ?Sized>(extent: usize, rng: &mut R) -> i64 {
    if extent <= 2 * NEXT_STATE_BORDER_PX {
        return (extent / 2) as i64;
    }
    rng.gen_range(NEXT_STATE_BORDER_PX..=extent - NEXT_STATE_BORDER_PX) as i64
}

/// Adds uniform noise in `[-amplitude, amplitude]` to every pixel.
pub fn perturb_pixels<R: Rng + ?Sized>(frame: &mut Frame, amplitude: f32, rng: &mut R) {
    if !(amplitude > 0.0) {
        return;
    }
    for px in frame.data.iter_mut() {
        *px += rng.gen_range(-amplitude..=amplitude);
    }
}

/// Crops and augments a copy of a cached sample. The cached value is never
/// modified.
pub fn prepare_drawn_sample<R: Rng + ?Sized>(
    cached: &Sample,
    params: &AugmentParams,
    rng: &mut R,
) -> Result<Sample, AssembleError> {
    let frame_err = |source| AssembleError::Frame {
        trace_id: cached.trace_id.to_string(),
        source,
    };
    let mut out = cached.clone();

    if params.crop_current {
        let window = current_state_window(cached, params, rng);
        out.processed_image = cached.processed_image.crop(&window).map_err(frame_err)?;
        out.pixel_action_map = cached.pixel_action_map.crop(&window).map_err(frame_err)?;
        out.reward_pixel_mask = cached.reward_pixel_mask.crop(&window).map_err(frame_err)?;
        out.action_x = cached.action_x - window.left as i32;
        out.action_y = cached.action_y - window.top as i32;
    }

    if params.crop_next {
        let next = &cached.next_processed_image;
        let window = next_state_window(next.width, next.height, params, rng);
        out.next_processed_image = next.crop(&window).map_err(frame_err)?;
        out.next_pixel_action_map = cached.next_pixel_action_map.crop(&window).map_err(frame_err)?;
    }

    perturb_pixels(&mut out.processed_image, params.pixel_noise, rng);
    Ok(out)
}

/// Merges drawn samples into one batch. Fixed-shape frames must agree in
/// shape; symbol lists are concatenated with per-sample start offsets.
pub fn assemble(samples: &[Sample]) -> Result<Batch, AssembleError> {
    if samples.is_empty() {
        return Err(AssembleError::Empty);
    }
    let mut batch = Batch::default();
    for s in samples {
        let frame_err = |source| AssembleError::Frame {
            trace_id: s.trace_id.to_string(),
            source,
        };
        check_symbols(s, "symbols", &s.symbol_indexes, &s.symbol_weights)?;
        check_symbols(s, "next_symbols", &s.next_symbol_indexes, &s.next_symbol_weights)?;
        check_symbols(
            s,
            "decaying_future_symbols",
            &s.decaying_future_symbol_indexes,
            &s.decaying_future_symbol_weights,
        )?;

        batch.processed_images.push(&s.processed_image).map_err(frame_err)?;
        batch.pixel_action_maps.push(&s.pixel_action_map).map_err(frame_err)?;
        batch.reward_pixel_masks.push(&s.reward_pixel_mask).map_err(frame_err)?;
        batch.next_processed_images.push(&s.next_processed_image).map_err(frame_err)?;
        batch.next_pixel_action_maps.push(&s.next_pixel_action_map).map_err(frame_err)?;

        batch.trace_ids.push(s.trace_id.clone());
        batch.action_xs.push(s.action_x);
        batch.action_ys.push(s.action_y);
        batch.action_types.push(s.action_type);
        batch.rewards.push(s.reward);
        batch.symbols.push(&s.symbol_indexes, &s.symbol_weights);
        batch.next_symbols.push(&s.next_symbol_indexes, &s.next_symbol_weights);
        batch
            .decaying_future_symbols
            .push(&s.decaying_future_symbol_indexes, &s.decaying_future_symbol_weights);
    }
    Ok(batch)
}

fn check_symbols(
    s: &Sample,
    field: &'static str,
    indexes: &[u32],
    weights: &[f32],
) -> Result<(), AssembleError> {
    if indexes.len() != weights.len() {
        return Err(AssembleError::SymbolLength {
            trace_id: s.trace_id.to_string(),
            field,
            indexes: indexes.len(),
            weights: weights.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tracefeed_core::types::TraceId;

    fn ramp(channels: usize, height: usize, width: usize) -> Frame {
        let data = (0..channels * height * width).map(|v| v as f32).collect();
        Frame::new(channels, height, width, data).unwrap()
    }

    fn sample(id: &str, width: usize, height: usize, symbols: usize) -> Sample {
        Sample {
            trace_id: TraceId::from(id),
            processed_image: ramp(3, height, width),
            pixel_action_map: ramp(2, height, width),
            reward_pixel_mask: ramp(1, height, width),
            next_processed_image: ramp(3, height, width),
            next_pixel_action_map: ramp(2, height, width),
            action_x: (width / 2) as i32,
            action_y: (height / 2) as i32,
            action_type: 0,
            reward: 1.0,
            symbol_indexes: (0..symbols as u32).collect(),
            symbol_weights: vec![1.0; symbols],
            next_symbol_indexes: vec![7; symbols + 1],
            next_symbol_weights: vec![0.5; symbols + 1],
            decaying_future_symbol_indexes: vec![],
            decaying_future_symbol_weights: vec![],
        }
    }

    #[test]
    fn crop_window_is_clamped_inside_image() {
        assert_eq!(
            crop_window_around(2, 2, 8, 8, 64, 32),
            CropWindow {
                left: 0,
                top: 0,
                right: 8,
                bottom: 8
            }
        );
        assert_eq!(
            crop_window_around(63, 31, 8, 8, 64, 32),
            CropWindow {
                left: 56,
                top: 24,
                right: 64,
                bottom: 32
            }
        );
        assert_eq!(crop_window_around(5, 5, 100, 8, 64, 32).width(), 64);
    }

    #[test]
    fn assemble_stacks_frames_and_emits_offsets() -> anyhow::Result<()> {
        let samples = vec![
            sample("a", 8, 6, 2),
            sample("b", 8, 6, 0),
            sample("c", 8, 6, 3),
        ];
        let batch = assemble(&samples)?;

        assert_eq!(batch.sample_count(), 3);
        assert_eq!(batch.processed_images.count, 3);
        assert_eq!(batch.processed_images.data.len(), 3 * 3 * 6 * 8);
        assert_eq!(batch.reward_pixel_masks.channels, 1);
        assert_eq!(batch.symbols.offsets, vec![0, 2, 2]);
        assert_eq!(batch.symbols.indexes.len(), 5);
        assert_eq!(batch.next_symbols.offsets, vec![0, 3, 4]);
        assert_eq!(batch.decaying_future_symbols.offsets, vec![0, 0, 0]);
        assert_eq!(batch.symbols.segment(2), Some(&[0u32, 1, 2][..]));
        Ok(())
    }

    #[test]
    fn assemble_rejects_mismatched_shapes() {
        let samples = vec![sample("a", 8, 6, 1), sample("b", 9, 6, 1)];
        match assemble(&samples) {
            Err(AssembleError::Frame { trace_id, source }) => {
                assert_eq!(trace_id, "b");
                assert!(matches!(source, FrameError::ShapeMismatch { .. }));
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
        assert!(matches!(assemble(&[]), Err(AssembleError::Empty)));
    }

    #[test]
    fn crop_shifts_action_into_window() -> anyhow::Result<()> {
        let params = AugmentParams {
            crop_current: true,
            crop_next: true,
            crop_width: 16,
            crop_height: 12,
            next_crop_width: 10,
            next_crop_height: 10,
            jitter_x: 4,
            jitter_y: 4,
            pixel_noise: 0.0,
        };
        let cached = sample("a", 64, 48, 1);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let drawn = prepare_drawn_sample(&cached, &params, &mut rng)?;
            assert_eq!(drawn.processed_image.shape(), (3, 12, 16));
            assert_eq!(drawn.reward_pixel_mask.shape(), (1, 12, 16));
            assert_eq!(drawn.next_processed_image.shape(), (3, 10, 10));
            assert!((0..16).contains(&drawn.action_x), "x {}", drawn.action_x);
            assert!((0..12).contains(&drawn.action_y), "y {}", drawn.action_y);
            let left = cached.action_x - drawn.action_x;
            let top = cached.action_y - drawn.action_y;
            assert_eq!(
                drawn.processed_image.get(0, 0, 0),
                cached.processed_image.get(0, top as usize, left as usize)
            );
        }
        assert_eq!(cached, sample("a", 64, 48, 1));
        Ok(())
    }

    #[test]
    fn noise_only_touches_current_image() -> anyhow::Result<()> {
        let params = AugmentParams {
            pixel_noise: 0.5,
            ..AugmentParams::disabled()
        };
        let cached = sample("a", 8, 8, 0);
        let mut rng = StdRng::seed_from_u64(5);
        let drawn = prepare_drawn_sample(&cached, &params, &mut rng)?;

        assert_ne!(drawn.processed_image, cached.processed_image);
        assert!(drawn
            .processed_image
            .data
            .iter()
            .zip(&cached.processed_image.data)
            .all(|(a, b)| (a - b).abs() <= 0.5));
        assert_eq!(drawn.next_processed_image, cached.next_processed_image);
        assert_eq!(drawn.pixel_action_map, cached.pixel_action_map);
        Ok(())
    }
}
