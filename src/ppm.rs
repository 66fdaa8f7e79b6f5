use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;

/// Drops the alpha channel of tightly packed RGBA8 pixels.
pub fn rgba_to_rgb(rgba: &[u8]) -> Vec<u8> {
    rgba.chunks_exact(4)
        .flat_map(|pixel| [pixel[0], pixel[1], pixel[2]])
        .collect()
}

/// Binary PPM: `P6 <width> <height> 255\n` followed by row-major RGB8.
pub fn write_ppm<W: Write>(mut writer: W, width: u32, height: u32, rgb: &[u8]) -> std::io::Result<()> {
    writeln!(writer, "P6 {} {} 255", width, height)?;
    writer.write_all(rgb)?;
    writer.flush()
}

pub fn save_ppm(path: &Path, width: u32, height: u32, rgb: &[u8]) -> Result<()> {
    let file = File::create(path)?;
    write_ppm(BufWriter::new(file), width, height, rgb)?;
    tracing::info!(path = %path.display(), width, height, "image written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_alpha() {
        let rgba = [1, 2, 3, 255, 4, 5, 6, 0];
        assert_eq!(rgba_to_rgb(&rgba), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn header_is_followed_by_raw_pixels() {
        let mut out = Vec::new();
        write_ppm(&mut out, 2, 1, &[10, 20, 30, 40, 50, 60]).unwrap();

        let header = b"P6 2 1 255\n";
        assert_eq!(&out[..header.len()], header);
        assert_eq!(&out[header.len()..], &[10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn saves_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.ppm");

        save_ppm(&path, 1, 1, &[7, 8, 9]).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"P6 1 1 255\n\x07\x08\x09");
    }
}
