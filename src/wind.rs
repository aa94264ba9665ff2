use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::errors::SimError;

const MAGIC: &[u8; 4] = b"HWND";
const VERSION: u16 = 1;

/// Axis metadata of one decompressed wind tensor.
///
/// The production GEFS grids are 0.5 degree (`n_lat == 361`, `n_lon == 720`)
/// with >= 1 h uniform time steps; the reader only assumes the axis spans
/// (latitude -90..=90, longitude 0..360 wrapping), so reduced test grids
/// decode through the same path.
#[derive(Debug, Clone, PartialEq)]
pub struct WindHeader {
    pub n_t: usize,
    pub n_p: usize,
    pub n_lat: usize,
    pub n_lon: usize,
    /// Uniform time step in seconds, >= 3600.
    pub dt_secs: u32,
    /// Epoch seconds of time index 0.
    pub base: i64,
    /// Pressure levels in hPa, sorted descending (surface first).
    pub levels: Vec<f32>,
}

impl WindHeader {
    pub fn values(&self) -> usize {
        self.n_t * self.n_p * self.n_lat * self.n_lon * 2
    }

    fn byte_len(&self) -> usize {
        26 + self.levels.len() * 4
    }

    /// Seconds covered by the time axis: `[base, base + (n_t-1)*dt]`.
    pub fn time_span(&self) -> (i64, i64) {
        (
            self.base,
            self.base + (self.n_t as i64 - 1) * self.dt_secs as i64,
        )
    }

    fn validate(&self) -> Result<(), String> {
        if self.n_t < 2 {
            return Err("time axis needs at least two steps".into());
        }
        if self.n_p < 2 {
            return Err("pressure axis needs at least two levels".into());
        }
        if self.n_lat < 2 || self.n_lon < 2 {
            return Err("degenerate spatial axes".into());
        }
        if self.dt_secs < 3600 {
            return Err(format!("time step {}s below one hour", self.dt_secs));
        }
        if !self.levels.windows(2).all(|w| w[0] > w[1]) {
            return Err("pressure levels must be strictly descending".into());
        }
        if self.levels.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err("non-finite pressure level".into());
        }
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < 26 || &buf[0..4] != MAGIC {
            return Err("bad wind file magic".into());
        }
        let u16_at = |o: usize| u16::from_le_bytes([buf[o], buf[o + 1]]);
        if u16_at(4) != VERSION {
            return Err(format!("unsupported wind file version {}", u16_at(4)));
        }
        let n_t = u16_at(6) as usize;
        let n_p = u16_at(8) as usize;
        let n_lat = u16_at(10) as usize;
        let n_lon = u16_at(12) as usize;
        let dt_secs = u32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]);
        let base = i64::from_le_bytes(buf[18..26].try_into().unwrap());

        if buf.len() < 26 + n_p * 4 {
            return Err("truncated pressure axis".into());
        }
        let levels = (0..n_p)
            .map(|i| {
                let o = 26 + i * 4;
                f32::from_le_bytes(buf[o..o + 4].try_into().unwrap())
            })
            .collect();

        let header = Self {
            n_t,
            n_p,
            n_lat,
            n_lon,
            dt_secs,
            base,
            levels,
        };
        header.validate()?;
        Ok(header)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(self.n_t as u16).to_le_bytes());
        out.extend_from_slice(&(self.n_p as u16).to_le_bytes());
        out.extend_from_slice(&(self.n_lat as u16).to_le_bytes());
        out.extend_from_slice(&(self.n_lon as u16).to_le_bytes());
        out.extend_from_slice(&self.dt_secs.to_le_bytes());
        out.extend_from_slice(&self.base.to_le_bytes());
        for level in &self.levels {
            out.extend_from_slice(&level.to_le_bytes());
        }
        out
    }
}

/// How the decompressed tensor is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Memory-mapped; pages are read lazily from disk. Default.
    Mapped,
    /// Whole tensor in anonymous memory; ensemble fan-outs hammer the
    /// interpolator hard enough that page-cache round trips dominate.
    Resident,
}

enum Tensor {
    Mapped { map: Mmap, data_offset: usize },
    Resident(Vec<f32>),
    /// Resident data already shed by teardown.
    Released,
}

/// One decompressed 4-D wind tensor for a single (cycle, member).
///
/// `get` performs the full axis inversion plus 4-D linear interpolation
/// (trilinear in space-altitude, linear in time) over the 16 surrounding
/// samples. No smoothing.
pub struct WindFile {
    header: WindHeader,
    tensor: Tensor,
}

impl WindFile {
    /// Open a wind artifact. `path` is the compressed `.zst` artifact; the
    /// decompressed sibling `.bin` is created on first use (atomic
    /// temp+rename, so a concurrent reader never sees a partial file).
    /// Callers serialize concurrent decompressors of the same artifact with
    /// the per-artifact lock owned by the disk cache.
    pub fn open(path: &Path, mode: AccessMode) -> Result<Self, SimError> {
        let bin = decompressed_path(path);
        if !bin.exists() {
            decompress(path, &bin).map_err(|e| SimError::SimulatorBuildFailed {
                member: 0,
                reason: format!("decompress {:?}: {e}", path),
            })?;
        }
        Self::open_plain(&bin, mode)
    }

    /// Open an already-decompressed tensor.
    pub fn open_plain(bin: &Path, mode: AccessMode) -> Result<Self, SimError> {
        let build_err = |reason: String| SimError::SimulatorBuildFailed { member: 0, reason };

        let file = File::open(bin).map_err(|e| build_err(format!("open {:?}: {e}", bin)))?;
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| build_err(format!("mmap {:?}: {e}", bin)))?;

        let header = WindHeader::decode(&map).map_err(build_err)?;
        let data_offset = header.byte_len();
        let want = data_offset + header.values() * 4;
        if map.len() != want {
            return Err(build_err(format!(
                "wind file {:?} is {} bytes, header implies {}",
                bin,
                map.len(),
                want
            )));
        }

        let tensor = match mode {
            AccessMode::Mapped => Tensor::Mapped { map, data_offset },
            AccessMode::Resident => {
                let mut values = Vec::with_capacity(header.values());
                for i in 0..header.values() {
                    let o = data_offset + i * 4;
                    values.push(f32::from_le_bytes(map[o..o + 4].try_into().unwrap()));
                }
                Tensor::Resident(values)
            }
        };

        Ok(Self { header, tensor })
    }

    pub fn header(&self) -> &WindHeader {
        &self.header
    }

    /// Wind components (u, v) in m/s at the given point.
    ///
    /// Axis conventions are inclusive-low / exclusive-high, except that the
    /// exact end of the time axis and the exact top pressure level are
    /// accepted by clamping to the final cell. Altitudes below the surface
    /// level clamp to the surface winds; altitudes above the top level are
    /// out of domain.
    pub fn get(&self, lat: f64, lon: f64, alt: f64, t: f64) -> Result<(f64, f64), SimError> {
        let h = &self.header;

        // time axis
        let tf = (t - h.base as f64) / h.dt_secs as f64;
        if !tf.is_finite() || tf < 0.0 || tf > (h.n_t - 1) as f64 {
            return Err(SimError::OutOfDomain);
        }
        let ti = (tf.floor() as usize).min(h.n_t - 2);
        let ft = tf - ti as f64;

        // altitude -> pressure -> level index
        let p = pressure_hpa(alt).ok_or(SimError::OutOfDomain)? as f32;
        let (pi, fp) = self.pressure_index(p)?;

        // latitude, clamped at the poles
        let r = (lat + 90.0) / 180.0 * (h.n_lat - 1) as f64;
        let r = r.clamp(0.0, (h.n_lat - 1) as f64);
        let ri = (r.floor() as usize).min(h.n_lat - 2);
        let fr = r - ri as f64;

        // longitude, wrapping mod 360
        let c = lon.rem_euclid(360.0) / 360.0 * h.n_lon as f64;
        let ci = (c.floor() as usize) % h.n_lon;
        let fc = c - c.floor();

        let mut uv = [0.0f64; 2];
        for (dt, wt) in [(0, 1.0 - ft), (1, ft)] {
            if wt == 0.0 {
                continue;
            }
            for (dp, wp) in [(0, 1.0 - fp), (1, fp)] {
                if wp == 0.0 {
                    continue;
                }
                for (dr, wr) in [(0, 1.0 - fr), (1, fr)] {
                    for (dc, wc) in [(0, 1.0 - fc), (1, fc)] {
                        let w = wt * wp * wr * wc;
                        if w == 0.0 {
                            continue;
                        }
                        let col = (ci + dc) % h.n_lon;
                        for comp in 0..2 {
                            uv[comp] +=
                                w * self.sample(ti + dt, pi + dp, ri + dr, col, comp);
                        }
                    }
                }
            }
        }

        if !uv[0].is_finite() || !uv[1].is_finite() {
            return Err(SimError::IntegratorFailed);
        }
        Ok((uv[0], uv[1]))
    }

    /// Locate `p` in the descending pressure axis. Below-surface pressures
    /// clamp to the surface level; above-top pressures are out of domain.
    fn pressure_index(&self, p: f32) -> Result<(usize, f64), SimError> {
        let levels = &self.header.levels;
        let top = *levels.last().unwrap();
        if p < top {
            return Err(SimError::OutOfDomain);
        }
        if p >= levels[0] {
            return Ok((0, 0.0));
        }
        // partition_point over a descending axis: first index with level < p
        let hi = levels.partition_point(|l| *l >= p);
        let j = hi - 1;
        if j == levels.len() - 1 {
            // exactly on the top level
            return Ok((j - 1, 1.0));
        }
        let frac = (levels[j] - p) as f64 / (levels[j] - levels[j + 1]) as f64;
        Ok((j, frac))
    }

    fn sample(&self, t: usize, p: usize, row: usize, col: usize, comp: usize) -> f64 {
        let h = &self.header;
        let idx = (((t * h.n_p + p) * h.n_lat + row) * h.n_lon + col) * 2 + comp;
        match &self.tensor {
            Tensor::Mapped { map, data_offset } => {
                let o = data_offset + idx * 4;
                f32::from_le_bytes(map[o..o + 4].try_into().unwrap()) as f64
            }
            Tensor::Resident(values) => values[idx] as f64,
            Tensor::Released => f64::NAN,
        }
    }

    /// Release the resident tensor ahead of dropping the handle. The cache
    /// teardown path calls this before the allocator purge hint so the
    /// largest allocation is returned first.
    pub fn shed(&mut self) {
        if matches!(self.tensor, Tensor::Resident(_)) {
            self.tensor = Tensor::Released;
        }
    }
}

/// Path of the decompressed sibling for a `.zst` artifact.
pub fn decompressed_path(artifact: &Path) -> PathBuf {
    artifact.with_extension("bin")
}

fn decompress(src: &Path, dst: &Path) -> std::io::Result<()> {
    let dir = dst.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        dst.file_name().unwrap_or_default().to_string_lossy()
    ));

    let mut reader = File::open(src)?;
    let mut writer = BufWriter::new(File::create(&tmp)?);
    zstd::stream::copy_decode(&mut reader, &mut writer)?;
    writer.flush()?;
    drop(writer);
    std::fs::rename(&tmp, dst)?;
    Ok(())
}

/// Write a zstd-compressed wind artifact. Test fixtures share this encoder
/// with the reader above.
pub fn write_artifact(path: &Path, header: &WindHeader, values: &[f32]) -> anyhow::Result<()> {
    anyhow::ensure!(
        values.len() == header.values(),
        "tensor has {} values, header implies {}",
        values.len(),
        header.values()
    );
    header
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid header: {e}"))?;

    let mut encoder = zstd::Encoder::new(BufWriter::new(File::create(path)?), 3)?;
    encoder.write_all(&header.encode())?;
    for v in values {
        encoder.write_all(&v.to_le_bytes())?;
    }
    encoder.finish()?.flush()?;
    Ok(())
}

/// ICAO standard-atmosphere pressure in hPa at a geometric altitude in
/// meters. `None` above the table (past ~51 km) or below -1 km.
///
/// The curve is strictly monotonic, which the pressure-axis binary search
/// relies on. It is independent of any forecast cycle.
pub fn pressure_hpa(alt_m: f64) -> Option<f64> {
    // (base altitude m, base temperature K, lapse rate K/m, base pressure hPa)
    const LAYERS: [(f64, f64, f64, f64); 5] = [
        (0.0, 288.15, -0.0065, 1013.25),
        (11_000.0, 216.65, 0.0, 226.3206),
        (20_000.0, 216.65, 0.001, 54.7489),
        (32_000.0, 228.65, 0.0028, 8.6802),
        (47_000.0, 270.65, 0.0, 1.1091),
    ];
    // g0 * M / R
    const GMR: f64 = 0.034_163_195;

    if !alt_m.is_finite() || alt_m < -1_000.0 || alt_m > 51_000.0 {
        return None;
    }

    let (base, temp, lapse, p0) = LAYERS
        .iter()
        .rev()
        .find(|(b, ..)| alt_m >= *b)
        .copied()
        .unwrap_or(LAYERS[0]);

    let dh = alt_m - base;
    let p = if lapse == 0.0 {
        p0 * (-GMR * dh / temp).exp()
    } else {
        p0 * (temp / (temp + lapse * dh)).powf(GMR / lapse)
    };
    Some(p)
}
