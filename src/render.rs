use crate::config::OutputConfig;
use crate::types::JoinedCounty;
use anyhow::{Context, Result};
use geo::{BoundingRect, Coord, LineString, MultiPolygon, Rect};
use image::{ImageFormat, RgbImage};
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use plotters::style::{register_font, FontStyle};
use serde::Serialize;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

// RdBu end points and midpoint
const NEGATIVE: RGBColor = RGBColor(0xb2, 0x18, 0x2b);
const ZERO: RGBColor = RGBColor(0xf7, 0xf7, 0xf7);
const POSITIVE: RGBColor = RGBColor(0x21, 0x66, 0xac);

const BACKGROUND: RGBColor = RGBColor(255, 255, 255);
const MISSING: RGBColor = RGBColor(211, 211, 211);
const OUTLINE: RGBColor = RGBColor(40, 40, 40);

const MARGIN: u32 = 20;
const TITLE_HEIGHT: u32 = 30;
const LEGEND_WIDTH: u32 = 20;
const LEGEND_GAP: u32 = 20;
// room right of the gradient for tick values
const LEGEND_LABELS: u32 = 60;
const NAME_WIDTH: f64 = 130.0;
const FONT_FAMILY: &str = "sans-serif";
// Lightest shade used when all values share a sign, so the smallest
// value is still distinguishable from zero.
const SEQUENTIAL_FLOOR: f64 = 0.15;

type Canvas<'a> = DrawingArea<BitMapBackend<'a>, Shift>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ColorScale {
    pub min: f64,
    pub max: f64,
    pub diverging: bool,
}

impl ColorScale {
    /// Zero-centred when the values straddle zero, `[min, max]` otherwise.
    pub fn from_values<I: IntoIterator<Item = i64>>(values: I) -> Option<Self> {
        let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
        for v in values {
            min = min.min(v as f64);
            max = max.max(v as f64);
        }
        if min > max {
            return None;
        }
        if min < 0.0 && max > 0.0 {
            let m = min.abs().max(max);
            Some(Self { min: -m, max: m, diverging: true })
        } else {
            Some(Self { min, max, diverging: false })
        }
    }

    /// Signed ramp position in [-1, 1]; negative is red, positive is blue.
    fn position(&self, value: f64) -> f64 {
        if self.diverging {
            return (value / self.max).clamp(-1.0, 1.0);
        }
        let span = self.max - self.min;
        if self.min >= 0.0 {
            let frac = if span > 0.0 { (value - self.min) / span } else { 1.0 };
            SEQUENTIAL_FLOOR + (1.0 - SEQUENTIAL_FLOOR) * frac.clamp(0.0, 1.0)
        } else {
            let frac = if span > 0.0 { (self.max - value) / span } else { 1.0 };
            -(SEQUENTIAL_FLOOR + (1.0 - SEQUENTIAL_FLOOR) * frac.clamp(0.0, 1.0))
        }
    }

    pub fn color(&self, value: f64) -> RGBColor {
        let s = self.position(value);
        if s < 0.0 {
            lerp(ZERO, NEGATIVE, -s)
        } else {
            lerp(ZERO, POSITIVE, s)
        }
    }

    pub fn color_for(&self, value: Option<i64>) -> RGBColor {
        value.map(|v| self.color(v as f64)).unwrap_or(MISSING)
    }

    /// Legend tick values from the top: max, zero when inside the range, min.
    pub fn ticks(&self) -> Vec<f64> {
        let mut ticks = vec![self.max];
        if self.min < 0.0 && self.max > 0.0 {
            ticks.push(0.0);
        }
        if self.min < self.max {
            ticks.push(self.min);
        }
        ticks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MapKind {
    Choropleth,
    Bars,
}

pub struct RenderedMap {
    pub image: RgbImage,
    pub kind: MapKind,
    pub scale: Option<ColorScale>,
    pub labelled: bool,
}

impl RenderedMap {
    pub fn to_png(&self) -> Result<Vec<u8>> {
        encode_png(&self.image)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create output directory")?;
        }
        self.image
            .save_with_format(path, ImageFormat::Png)
            .with_context(|| format!("Failed to save map {:?}", path))?;
        info!("Wrote {:?} map to {:?}", self.kind, path);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub width: u32,
    pub height: u32,
    pub title: Option<String>,
    pub fonts: Vec<PathBuf>,
}

impl From<&OutputConfig> for RenderOptions {
    fn from(output: &OutputConfig) -> Self {
        Self {
            width: output.width.max(2 * MARGIN + LEGEND_GAP + LEGEND_WIDTH + LEGEND_LABELS + 10),
            height: output.height.max(2 * MARGIN + TITLE_HEIGHT + 10),
            title: None,
            fonts: output.fonts.clone(),
        }
    }
}

// Pixel area left of the legend and below the title.
#[derive(Debug, Clone, Copy)]
struct Frame {
    left: f64,
    top: f64,
    width: f64,
    height: f64,
}

impl RenderOptions {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    fn map_frame(&self) -> Frame {
        Frame {
            left: MARGIN as f64,
            top: (MARGIN + TITLE_HEIGHT) as f64,
            width: (self.width - 2 * MARGIN - LEGEND_GAP - LEGEND_WIDTH - LEGEND_LABELS) as f64,
            height: (self.height - 2 * MARGIN - TITLE_HEIGHT) as f64,
        }
    }

    fn legend_left(&self) -> i32 {
        (self.width - MARGIN - LEGEND_LABELS - LEGEND_WIDTH) as i32
    }
}

static LABEL_FONT: OnceLock<bool> = OnceLock::new();

/// Registers the first readable candidate as the label font. Without one,
/// maps are drawn without text.
fn label_font_ready(candidates: &[PathBuf]) -> bool {
    *LABEL_FONT.get_or_init(|| {
        for path in candidates {
            let Ok(bytes) = fs::read(path) else { continue };
            // registered fonts live for the whole process
            let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
            match register_font(FONT_FAMILY, FontStyle::Normal, bytes) {
                Ok(()) => {
                    info!("Using {:?} for map labels", path);
                    return true;
                }
                Err(_) => warn!("Font {:?} unusable", path),
            }
        }
        warn!("No label font found; maps are drawn without title and legend values");
        false
    })
}

/// Choropleth when any county has geometry, bar chart otherwise.
pub fn render(joined: &[JoinedCounty], options: &RenderOptions) -> Result<RenderedMap> {
    let scale = ColorScale::from_values(joined.iter().filter_map(|c| c.value));
    let kind = if joined.iter().any(|c| c.geometry.is_some()) {
        MapKind::Choropleth
    } else {
        MapKind::Bars
    };
    let labelled = label_font_ready(&options.fonts);

    let (width, height) = (options.width, options.height);
    let mut buffer = vec![0u8; width as usize * height as usize * 3];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        root.fill(&BACKGROUND)?;

        match kind {
            MapKind::Choropleth => draw_choropleth(&root, joined, scale, options)?,
            MapKind::Bars => draw_bars(&root, joined, scale, options, labelled)?,
        }
        if let Some(scale) = scale {
            draw_legend(&root, scale, options, labelled)?;
        }
        if let (true, Some(title)) = (labelled, &options.title) {
            let style = (FONT_FAMILY, 20).into_font().color(&OUTLINE).pos(Pos::new(HPos::Left, VPos::Center));
            root.draw_text(title, &style, (MARGIN as i32, (MARGIN + TITLE_HEIGHT / 2) as i32))?;
        }
        root.present()?;
    }

    let image = RgbImage::from_raw(width, height, buffer).context("Bitmap buffer has the wrong size")?;
    Ok(RenderedMap { image, kind, scale, labelled })
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .context("Failed to encode PNG")?;
    Ok(buf)
}

// Linear fit of the layer's bounding box into the map frame.
struct Projection {
    min_x: f64,
    max_y: f64,
    x_factor: f64,
    scale: f64,
    offset_x: f64,
    offset_y: f64,
}

impl Projection {
    fn fit(bbox: Rect<f64>, frame: Frame) -> Self {
        let geographic = bbox.min().x >= -180.0 && bbox.max().x <= 180.0
            && bbox.min().y >= -90.0 && bbox.max().y <= 90.0;
        // Shrink longitudes so shapes are not stretched at high latitude.
        let x_factor = if geographic {
            ((bbox.min().y + bbox.max().y) / 2.0).to_radians().cos()
        } else {
            1.0
        };

        let span_x = ((bbox.max().x - bbox.min().x) * x_factor).max(f64::EPSILON);
        let span_y = (bbox.max().y - bbox.min().y).max(f64::EPSILON);
        let scale = (frame.width / span_x).min(frame.height / span_y);

        Self {
            min_x: bbox.min().x,
            max_y: bbox.max().y,
            x_factor,
            scale,
            offset_x: frame.left + (frame.width - span_x * scale) / 2.0,
            offset_y: frame.top + (frame.height - span_y * scale) / 2.0,
        }
    }

    fn project(&self, c: Coord<f64>) -> (i32, i32) {
        (
            (self.offset_x + (c.x - self.min_x) * self.x_factor * self.scale).round() as i32,
            (self.offset_y + (self.max_y - c.y) * self.scale).round() as i32,
        )
    }

    fn ring(&self, ring: &LineString<f64>) -> Vec<(i32, i32)> {
        ring.coords().map(|c| self.project(*c)).collect()
    }
}

fn layer_bounds(joined: &[JoinedCounty]) -> Option<Rect<f64>> {
    joined
        .iter()
        .filter_map(|c| c.geometry.as_ref()?.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                Coord { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                Coord { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
            )
        })
}

fn extent(geometry: &MultiPolygon<f64>) -> f64 {
    geometry.bounding_rect().map(|r| r.width() * r.height()).unwrap_or(0.0)
}

fn draw_choropleth(
    root: &Canvas<'_>,
    joined: &[JoinedCounty],
    scale: Option<ColorScale>,
    options: &RenderOptions,
) -> Result<()> {
    let Some(bbox) = layer_bounds(joined) else { return Ok(()) };
    let projection = Projection::fit(bbox, options.map_frame());

    // Largest first, so a county lying in another's hole is painted after
    // the hole is cleared.
    let mut shapes: Vec<(&MultiPolygon<f64>, Option<i64>)> = joined
        .iter()
        .filter_map(|c| Some((c.geometry.as_ref()?, c.value)))
        .collect();
    shapes.sort_by(|a, b| extent(b.0).total_cmp(&extent(a.0)));

    for (geometry, value) in &shapes {
        let color = scale.map(|s| s.color_for(*value)).unwrap_or(MISSING);
        for polygon in geometry.iter() {
            root.draw(&Polygon::new(projection.ring(polygon.exterior()), color.filled()))?;
            for hole in polygon.interiors() {
                root.draw(&Polygon::new(projection.ring(hole), BACKGROUND.filled()))?;
            }
        }
    }
    // outlines last so neighbours do not paint over shared borders
    for (geometry, _) in &shapes {
        for polygon in geometry.iter() {
            for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
                root.draw(&PathElement::new(projection.ring(ring), OUTLINE.stroke_width(1)))?;
            }
        }
    }
    Ok(())
}

// Vertical gradient with max at the top; ticks and values on the right.
fn draw_legend(root: &Canvas<'_>, scale: ColorScale, options: &RenderOptions, labelled: bool) -> Result<()> {
    let x0 = options.legend_left();
    let x1 = x0 + LEGEND_WIDTH as i32;
    let top = (MARGIN + TITLE_HEIGHT) as i32;
    let bottom = (options.height - MARGIN) as i32;
    let span = (bottom - top).max(1) as f64;
    let range = scale.max - scale.min;

    for y in top..bottom {
        let value = scale.max - range * (y - top) as f64 / span;
        root.draw(&Rectangle::new([(x0, y), (x1 - 1, y)], scale.color(value).filled()))?;
    }
    root.draw(&Rectangle::new([(x0 - 1, top - 1), (x1, bottom)], OUTLINE.stroke_width(1)))?;

    let style = (FONT_FAMILY, 13).into_font().color(&OUTLINE).pos(Pos::new(HPos::Left, VPos::Center));
    for tick in scale.ticks() {
        let y = if range > 0.0 {
            top + ((scale.max - tick) / range * span).round() as i32
        } else {
            top
        };
        root.draw(&PathElement::new(vec![(x1, y), (x1 + 4, y)], OUTLINE.stroke_width(1)))?;
        if labelled {
            root.draw_text(&format!("{tick:.0}"), &style, (x1 + 7, y))?;
        }
    }
    Ok(())
}

/// Fallback when no county has a shape: one horizontal bar per county.
fn draw_bars(
    root: &Canvas<'_>,
    joined: &[JoinedCounty],
    scale: Option<ColorScale>,
    options: &RenderOptions,
    labelled: bool,
) -> Result<()> {
    if joined.is_empty() {
        return Ok(());
    }

    let mut order: Vec<&JoinedCounty> = joined.iter().collect();
    order.sort_by(|a, b| match (a.value, b.value) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.name.cmp(&b.name),
    });

    let lo = order.iter().filter_map(|c| c.value).min().unwrap_or(0).min(0) as f64;
    let hi = order.iter().filter_map(|c| c.value).max().unwrap_or(0).max(0) as f64;
    let span = (hi - lo).max(1.0);

    let frame = options.map_frame();
    // county names take the left part of the frame
    let name_width = if labelled { NAME_WIDTH.min(frame.width / 3.0) } else { 0.0 };
    let plot_left = frame.left + name_width;
    let plot_width = frame.width - name_width;
    let slot = (frame.height / order.len() as f64).max(1.0);
    let bar_height = (slot * 0.75).round().max(1.0) as i32;
    let to_x = |v: f64| (plot_left + (v - lo) / span * plot_width).round() as i32;
    let zero_x = to_x(0.0);

    let style = (FONT_FAMILY, 12).into_font().color(&OUTLINE).pos(Pos::new(HPos::Left, VPos::Center));
    for (i, county) in order.iter().enumerate() {
        let y0 = (frame.top + i as f64 * slot).round() as i32;
        let y1 = y0 + bar_height - 1;
        let (x_start, x_end, color) = match (county.value, scale) {
            (Some(v), Some(s)) => {
                let x = to_x(v as f64);
                (x.min(zero_x), x.max(zero_x), s.color(v as f64))
            }
            _ => (zero_x, zero_x + 4, MISSING),
        };
        root.draw(&Rectangle::new([(x_start, y0), (x_end.max(x_start + 1), y1)], color.filled()))?;
        if labelled {
            root.draw_text(&county.name, &style, (frame.left as i32, (y0 + y1) / 2))?;
        }
    }

    let bottom = (frame.top + frame.height) as i32;
    root.draw(&PathElement::new(
        vec![(zero_x, frame.top as i32), (zero_x, bottom)],
        OUTLINE.stroke_width(1),
    ))?;
    Ok(())
}

fn lerp(a: RGBColor, b: RGBColor, t: f64) -> RGBColor {
    let t = t.clamp(0.0, 1.0);
    let mix = |x: u8, y: u8| (x as f64 + (y as f64 - x as f64) * t).round() as u8;
    RGBColor(mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
}
