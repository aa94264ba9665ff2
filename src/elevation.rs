use anyhow::{Context, Result, bail};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Global ground-elevation grid, memory-mapped for the process lifetime.
///
/// The backing file is a plain 2-D array of little-endian `i16` meters,
/// rows running north to south from +90, columns east from -180, with a
/// fixed 2:1 aspect (`cols == 2 * rows`). The grid shape is inferred from
/// the file size; the production grid is ~0.008 degree resolution. The file
/// is treated as immutable once opened, so the mapping is shared read-only
/// across every request.
#[derive(Debug)]
pub struct ElevationGrid {
    map: Mmap,
    rows: usize,
    cols: usize,
}

impl ElevationGrid {
    /// Map an elevation grid from disk, inferring the shape from file size.
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("open elevation grid {:?}", path))?;
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mmap elevation grid {:?}", path))?;

        // bytes = rows * cols * 2 with cols = 2 * rows
        let cells = map.len() / 2;
        let rows = ((cells / 2) as f64).sqrt() as usize;
        if rows == 0 || rows * rows * 4 != map.len() {
            bail!(
                "elevation grid {:?} has unexpected size {} (want rows*cols*2 with cols=2*rows)",
                path,
                map.len()
            );
        }

        Ok(Self {
            map,
            rows,
            cols: rows * 2,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Ground elevation in meters at the given coordinates, bilinearly
    /// interpolated from the four surrounding samples. Latitude is clamped
    /// to the grid; longitude wraps mod 360.
    pub fn elev(&self, lat: f64, lon: f64) -> f64 {
        let row = (90.0 - lat) / 180.0 * (self.rows as f64 - 1.0);
        let row = row.clamp(0.0, self.rows as f64 - 1.0);
        let col = (lon + 180.0).rem_euclid(360.0) / 360.0 * self.cols as f64;

        let row_low = row.floor();
        let row_frac = row - row_low;
        let row_low = row_low as usize;
        let row_high = (row_low + 1).min(self.rows - 1);

        let col_low = col.floor();
        let col_frac = col - col_low;
        let col_low = col_low as usize % self.cols;
        let col_high = (col_low + 1) % self.cols;

        let v00 = self.sample(row_low, col_low);
        let v01 = self.sample(row_low, col_high);
        let v10 = self.sample(row_high, col_low);
        let v11 = self.sample(row_high, col_high);

        let low = v00 * (1.0 - col_frac) + v01 * col_frac;
        let high = v10 * (1.0 - col_frac) + v11 * col_frac;
        low * (1.0 - row_frac) + high * row_frac
    }

    fn sample(&self, row: usize, col: usize) -> f64 {
        let offset = (row * self.cols + col) * 2;
        i16::from_le_bytes([self.map[offset], self.map[offset + 1]]) as f64
    }
}

/// Write a grid in the on-disk layout. Test fixtures share this encoder
/// with the reader above.
pub fn write_grid(path: &Path, rows: usize, sample: impl Fn(f64, f64) -> i16) -> Result<()> {
    use std::io::Write;

    let cols = rows * 2;
    let mut out = std::io::BufWriter::new(File::create(path)?);
    for r in 0..rows {
        let lat = 90.0 - r as f64 / (rows as f64 - 1.0) * 180.0;
        for c in 0..cols {
            let lon = -180.0 + c as f64 / cols as f64 * 360.0;
            out.write_all(&sample(lat, lon).to_le_bytes())?;
        }
    }
    out.flush()?;
    Ok(())
}
