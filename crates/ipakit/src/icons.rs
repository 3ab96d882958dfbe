//! App icon asset catalog generation.
//!
//! One source image is resampled into every size the iOS `AppIcon` set
//! requires, written into `Assets.xcassets/AppIcon.appiconset` with its
//! `Contents.json`, and compiled into the bundle with `actool`.

use crate::context::BuildContext;
use crate::pipeline::{TaskOutcome, TaskResult};
use crate::tools::{args, ToolRunner};
use crate::Result;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the icon set inside the asset catalog.
pub const APP_ICON_SET: &str = "AppIcon";

/// Side of the generated placeholder icon.
const DEFAULT_ICON_SIZE: u32 = 1024;

/// Pixel sizes referenced by the OTA install manifest.
pub const OTA_ICON_SIZES: [u32; 2] = [57, 512];

/// One entry of the icon set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IconVariant {
    pub idiom: &'static str,
    /// Point size as written in `Contents.json` (`"83.5"`).
    pub points: &'static str,
    pub scale: u32,
}

impl IconVariant {
    const fn new(idiom: &'static str, points: &'static str, scale: u32) -> Self {
        Self {
            idiom,
            points,
            scale,
        }
    }

    /// `round(points * scale)`
    pub fn pixels(&self) -> u32 {
        let points: f64 = self.points.parse().unwrap_or(0.0);
        (points * f64::from(self.scale)).round() as u32
    }

    pub fn filename(&self) -> String {
        format!("icon-{}@{}x-{}.png", self.points, self.scale, self.idiom)
    }
}

/// Every variant Xcode requires for an iOS app icon set.
pub const ICON_VARIANTS: &[IconVariant] = &[
    IconVariant::new("iphone", "20", 2),
    IconVariant::new("iphone", "20", 3),
    IconVariant::new("iphone", "29", 2),
    IconVariant::new("iphone", "29", 3),
    IconVariant::new("iphone", "40", 2),
    IconVariant::new("iphone", "40", 3),
    IconVariant::new("iphone", "60", 2),
    IconVariant::new("iphone", "60", 3),
    IconVariant::new("ipad", "20", 1),
    IconVariant::new("ipad", "20", 2),
    IconVariant::new("ipad", "29", 1),
    IconVariant::new("ipad", "29", 2),
    IconVariant::new("ipad", "40", 1),
    IconVariant::new("ipad", "40", 2),
    IconVariant::new("ipad", "76", 1),
    IconVariant::new("ipad", "76", 2),
    IconVariant::new("ipad", "83.5", 2),
    IconVariant::new("ios-marketing", "1024", 1),
];

#[derive(Serialize)]
struct CatalogInfo {
    author: &'static str,
    version: u32,
}

const CATALOG_INFO: CatalogInfo = CatalogInfo {
    author: "xcode",
    version: 1,
};

#[derive(Serialize)]
struct CatalogContents {
    info: CatalogInfo,
}

#[derive(Serialize)]
struct IconSetContents {
    images: Vec<IconSetImage>,
    info: CatalogInfo,
}

#[derive(Serialize)]
struct IconSetImage {
    filename: String,
    idiom: &'static str,
    scale: String,
    size: String,
}

impl From<&IconVariant> for IconSetImage {
    fn from(variant: &IconVariant) -> Self {
        Self {
            filename: variant.filename(),
            idiom: variant.idiom,
            scale: format!("{}x", variant.scale),
            size: format!("{0}x{0}", variant.points),
        }
    }
}

/// Resamples the project icon and compiles the asset catalog.
pub struct IconAssetGenerator {
    runner: Arc<dyn ToolRunner>,
}

impl IconAssetGenerator {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }

    /// Writes the asset catalog and OTA icons, then runs `actool`.
    ///
    /// A project without an icon, or whose icon file is absent, gets a
    /// generated placeholder. Output is identical across runs for the same
    /// source image.
    pub fn generate(&self, ctx: &BuildContext) -> TaskResult {
        let source = load_source_icon(ctx)?;
        let catalog = ctx.paths.asset_catalog();
        let icon_set = catalog.join(format!("{}.appiconset", APP_ICON_SET));
        fs::create_dir_all(&icon_set)?;

        let rendered: Vec<(PathBuf, Vec<u8>)> = ICON_VARIANTS
            .par_iter()
            .map(|variant| -> Result<(PathBuf, Vec<u8>)> {
                let png = render_png(&source, variant.pixels())?;
                Ok((icon_set.join(variant.filename()), png))
            })
            .collect::<Result<_>>()?;

        for (path, png) in &rendered {
            fs::write(path, png)?;
        }
        write_json(
            &icon_set.join("Contents.json"),
            &IconSetContents {
                images: ICON_VARIANTS.iter().map(IconSetImage::from).collect(),
                info: CATALOG_INFO,
            },
        )?;
        write_json(
            &catalog.join("Contents.json"),
            &CatalogContents { info: CATALOG_INFO },
        )?;

        let ota_dir = ota_icon_dir(ctx);
        fs::create_dir_all(&ota_dir)?;
        for size in OTA_ICON_SIZES {
            fs::write(ota_icon_path(ctx, size), render_png(&source, size)?)?;
        }
        debug!(variants = rendered.len(), catalog = %catalog.display(), "icon set written");

        self.compile(ctx, &catalog)?;
        info!("app icon compiled");
        Ok(TaskOutcome::Done)
    }

    fn compile(&self, ctx: &BuildContext, catalog: &Path) -> Result<()> {
        let argv = args([
            "--output-format".into(),
            "human-readable-text".into(),
            "--notices".into(),
            "--warnings".into(),
            "--output-partial-info-plist".into(),
            ctx.paths.actool_info_plist().into_os_string(),
            "--app-icon".into(),
            APP_ICON_SET.into(),
            "--compress-pngs".into(),
            "--platform".into(),
            "iphoneos".into(),
            "--minimum-deployment-target".into(),
            ctx.config.minimum_os_version.clone().into(),
            "--compile".into(),
            ctx.paths.app_bundle.clone().into_os_string(),
            catalog.as_os_str().to_os_string(),
        ]);
        self.runner.run_checked(&ctx.config.tools.actool, &argv)?;
        Ok(())
    }
}

/// `<work>/ota`
pub fn ota_icon_dir(ctx: &BuildContext) -> PathBuf {
    ctx.paths.work_dir.join("ota")
}

/// `<work>/ota/icon-<size>.png`
pub fn ota_icon_path(ctx: &BuildContext, size: u32) -> PathBuf {
    ota_icon_dir(ctx).join(format!("icon-{}.png", size))
}

fn load_source_icon(ctx: &BuildContext) -> Result<DynamicImage> {
    let Some(icon) = ctx.project.icon.as_deref() else {
        debug!("project has no icon; using placeholder");
        return Ok(placeholder_icon(DEFAULT_ICON_SIZE));
    };
    let path = ctx.paths.assets_dir.join(icon);
    if !path.is_file() {
        warn!(icon = %path.display(), "icon not found; using placeholder");
        return Ok(placeholder_icon(DEFAULT_ICON_SIZE));
    }
    Ok(image::open(&path)?)
}

fn render_png(source: &DynamicImage, size: u32) -> Result<Vec<u8>> {
    let resized = source.resize_exact(size, size, FilterType::Lanczos3);
    let mut png = Vec::new();
    resized.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');
    fs::write(path, json)?;
    Ok(())
}

/// Opaque diagonal gradient; iOS icons may not carry alpha.
pub fn placeholder_icon(size: u32) -> DynamicImage {
    let mut img = RgbaImage::new(size, size);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let gradient = (x + y) as f32 / (2 * size) as f32;
        let r = (60.0 + gradient * 100.0) as u8;
        let g = (80.0 + gradient * 60.0) as u8;
        let b = (180.0 + gradient * 40.0) as u8;
        *pixel = Rgba([r, g, b, 255]);
    }
    DynamicImage::ImageRgba8(img)
}
