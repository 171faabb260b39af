use palette::white_point::D65;
use palette::{FromColor, IntoColor, Lab, LinSrgb, Srgb};

/// sRGB (8-bit) to CIE L*a*b* under D65.
pub(crate) fn rgb_to_lab(rgb: [u8; 3]) -> [f32; 3] {
    let srgb: Srgb<f32> = Srgb::new(rgb[0], rgb[1], rgb[2]).into_format();
    let lab: Lab = Lab::from_color(srgb.into_linear());
    [lab.l, lab.a, lab.b]
}

/// CIE L*a*b* back to 8-bit sRGB, clamping out-of-gamut colours.
pub(crate) fn lab_to_rgb(lab: [f32; 3]) -> [u8; 3] {
    let lab: Lab<D65, f32> = Lab::new(lab[0], lab[1], lab[2]);
    let lin: LinSrgb<f32> = lab.into_color();
    let srgb: Srgb<f32> = Srgb::from_linear(lin);
    [
        to_channel(srgb.red),
        to_channel(srgb.green),
        to_channel(srgb.blue),
    ]
}

/// Euclidean distance in Lab, computed in f64 so tiny and huge channel
/// differences neither underflow nor overflow when squared.
pub(crate) fn lab_distance(a: [f32; 3], b: [f32; 3]) -> f64 {
    let dl = f64::from(a[0]) - f64::from(b[0]);
    let da = f64::from(a[1]) - f64::from(b[1]);
    let db = f64::from(a[2]) - f64::from(b[2]);
    (dl * dl + da * da + db * db).sqrt()
}

fn to_channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}
