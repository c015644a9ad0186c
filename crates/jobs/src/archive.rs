//! Chart archive handling.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;

/// Unpack a gzipped chart tarball into a scratch directory and read
/// `<chart>/values.yaml`. Blocking; run it off the async workers.
pub fn read_chart_values(archive: &[u8], chart: &str) -> Result<Vec<u8>> {
    let dir = tempfile::tempdir().context("creating scratch directory")?;
    let mut tarball = tar::Archive::new(GzDecoder::new(archive));
    tarball.unpack(dir.path()).context("unpacking chart archive")?;
    let path = dir.path().join(chart).join("values.yaml");
    std::fs::read(&path).with_context(|| format!("reading {}/values.yaml", chart))
}

#[cfg(test)]
pub(crate) fn chart_archive(chart: &str, values: &str) -> Vec<u8> {
    use flate2::{write::GzEncoder, Compression};

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, body) in [("Chart.yaml", format!("apiVersion: v2\nname: {}\nversion: 0.1.0\n", chart)), ("values.yaml", values.to_string())] {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, format!("{}/{}", chart, name), body.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
