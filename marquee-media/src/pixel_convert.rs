//! # Pixel Conversion - I420 to RGBA
//!
//! Decoded pictures come out planar YUV 4:2:0; the display surface wants
//! tightly packed RGBA at the container's aspect-corrected display size.
//! Fixed-point BT.601 limited-range math, nearest-neighbor scaling.

use crate::decode::VideoPicture;

/// BT.601 limited range, 8.8 fixed point:
/// R = 1.164(Y-16) + 1.596(V-128)
/// G = 1.164(Y-16) - 0.392(U-128) - 0.813(V-128)
/// B = 1.164(Y-16) + 2.017(U-128)
const Y_COEF: i32 = 298;
const RV_COEF: i32 = 409;
const GU_COEF: i32 = 100;
const GV_COEF: i32 = 208;
const BU_COEF: i32 = 516;

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[inline]
fn yuv_to_rgba(y: u8, u: u8, v: u8, out: &mut [u8]) {
    let c = Y_COEF * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    out[0] = clamp_u8((c + RV_COEF * e + 128) >> 8);
    out[1] = clamp_u8((c - GU_COEF * d - GV_COEF * e + 128) >> 8);
    out[2] = clamp_u8((c + BU_COEF * d + 128) >> 8);
    out[3] = 255;
}

/// Convert a decoded picture to RGBA at `dst_w` x `dst_h`.
///
/// `out` is cleared and refilled; its final length is `dst_w * dst_h * 4`.
/// A picture with empty planes (or zero target size) yields an empty `out`.
pub fn i420_to_rgba(picture: &VideoPicture, dst_w: u32, dst_h: u32, out: &mut Vec<u8>) {
    out.clear();

    let (src_w, src_h) = (picture.width as usize, picture.height as usize);
    let (dst_w, dst_h) = (dst_w as usize, dst_h as usize);
    let (cw, ch) = ((src_w + 1) / 2, (src_h + 1) / 2);
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return;
    }
    if picture.data.len() < src_w * src_h + 2 * cw * ch {
        return;
    }

    let (y_plane, rest) = picture.data.split_at(src_w * src_h);
    let (u_plane, v_plane) = rest.split_at(cw * ch);

    out.resize(dst_w * dst_h * 4, 0);
    for dy in 0..dst_h {
        let sy = dy * src_h / dst_h;
        let y_row = &y_plane[sy * src_w..];
        let u_row = &u_plane[(sy / 2) * cw..];
        let v_row = &v_plane[(sy / 2) * cw..];
        let dst_row = &mut out[dy * dst_w * 4..(dy + 1) * dst_w * 4];

        for dx in 0..dst_w {
            let sx = dx * src_w / dst_w;
            yuv_to_rgba(
                y_row[sx],
                u_row[sx / 2],
                v_row[sx / 2],
                &mut dst_row[dx * 4..dx * 4 + 4],
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
