// Run output: per-step rows of entity attributes.
//
// Every exporter receives (step, replicate, entity name, attribute
// map); the map is ordered so a run's output is stable byte for
// byte. The wire writer speaks the streaming line protocol used by
// remote runs.

use std::collections::BTreeMap;
use std::io::Write;

use serde::Serialize;

use crate::error::EngineResult;

pub trait Exporter {
    fn write(
        &mut self,
        step: i64,
        replicate: u32,
        entity: &str,
        attrs: &BTreeMap<String, String>,
    ) -> EngineResult<()>;
}

/// CSV rows: step, replicate, entity, then `name=value` cells in
/// attribute order.
pub struct CsvExporter<W: Write> {
    out: W,
}

impl<W: Write> CsvExporter<W> {
    pub fn new(out: W) -> CsvExporter<W> {
        CsvExporter { out }
    }
}

impl<W: Write> Exporter for CsvExporter<W> {
    fn write(
        &mut self,
        step: i64,
        replicate: u32,
        entity: &str,
        attrs: &BTreeMap<String, String>,
    ) -> EngineResult<()> {
        let mut row = vec![step.to_string(), replicate.to_string(), entity.to_string()];
        for (name, value) in attrs {
            row.push(format!("{}={}", name, value));
        }
        writeln!(self.out, "{}", row.join(","))?;
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonRow<'a> {
    step: i64,
    replicate: u32,
    entity: &'a str,
    attributes: &'a BTreeMap<String, String>,
}

/// One JSON object per line.
pub struct JsonLinesExporter<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesExporter<W> {
    pub fn new(out: W) -> JsonLinesExporter<W> {
        JsonLinesExporter { out }
    }
}

impl<W: Write> Exporter for JsonLinesExporter<W> {
    fn write(
        &mut self,
        step: i64,
        replicate: u32,
        entity: &str,
        attrs: &BTreeMap<String, String>,
    ) -> EngineResult<()> {
        let row = JsonRow {
            step,
            replicate,
            entity,
            attributes: attrs,
        };
        let encoded = serde_json::to_string(&row)
            .map_err(|e| crate::error::JoshError::Io(e.to_string()))?;
        writeln!(self.out, "{}", encoded)?;
        Ok(())
    }
}

/// The streaming wire format, bit-exact:
///
///   [N] payload      data row for replicate N
///   [N]              empty row, consumers ignore it
///   [progress K]     current step is K
///   [end N]          replicate N finished
///   [error] text     error message
pub struct WireWriter<W: Write> {
    out: W,
}

impl<W: Write> WireWriter<W> {
    pub fn new(out: W) -> WireWriter<W> {
        WireWriter { out }
    }

    pub fn data(&mut self, replicate: u32, payload: &str) -> EngineResult<()> {
        if payload.is_empty() {
            writeln!(self.out, "[{}]", replicate)?;
        } else {
            writeln!(self.out, "[{}] {}", replicate, payload)?;
        }
        Ok(())
    }

    pub fn progress(&mut self, step: i64) -> EngineResult<()> {
        writeln!(self.out, "[progress {}]", step)?;
        Ok(())
    }

    pub fn end(&mut self, replicate: u32) -> EngineResult<()> {
        writeln!(self.out, "[end {}]", replicate)?;
        Ok(())
    }

    pub fn error(&mut self, message: &str) -> EngineResult<()> {
        writeln!(self.out, "[error] {}", message)?;
        Ok(())
    }
}

impl<W: Write> Exporter for WireWriter<W> {
    fn write(
        &mut self,
        step: i64,
        replicate: u32,
        entity: &str,
        attrs: &BTreeMap<String, String>,
    ) -> EngineResult<()> {
        let mut cells = vec![format!("step={}", step), format!("entity={}", entity)];
        for (name, value) in attrs {
            cells.push(format!("{}={}", name, value));
        }
        let payload = cells.join(",");
        self.data(replicate, &payload)
    }
}

/// Collects rows in memory; the determinism tests compare two runs'
/// buffers byte for byte.
#[derive(Default)]
pub struct MemoryExporter {
    pub rows: Vec<String>,
}

impl MemoryExporter {
    pub fn new() -> MemoryExporter {
        MemoryExporter::default()
    }

    pub fn joined(&self) -> String {
        self.rows.join("\n")
    }
}

impl Exporter for MemoryExporter {
    fn write(
        &mut self,
        step: i64,
        replicate: u32,
        entity: &str,
        attrs: &BTreeMap<String, String>,
    ) -> EngineResult<()> {
        let mut row = format!("{},{},{}", step, replicate, entity);
        for (name, value) in attrs {
            row.push_str(&format!(",{}={}", name, value));
        }
        self.rows.push(row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_csv_rows_are_stable() {
        let mut buffer = Vec::new();
        {
            let mut csv = CsvExporter::new(&mut buffer);
            csv.write(0, 1, "Tree", &attrs(&[("height", "2 m"), ("age", "5 year")]))
                .unwrap();
        }
        // BTreeMap ordering puts age before height.
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "0,1,Tree,age=5 year,height=2 m\n"
        );
    }

    #[test]
    fn test_wire_format() {
        let mut buffer = Vec::new();
        {
            let mut wire = WireWriter::new(&mut buffer);
            wire.data(2, "a=1").unwrap();
            wire.data(2, "").unwrap();
            wire.progress(7).unwrap();
            wire.end(2).unwrap();
            wire.error("boom").unwrap();
        }
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "[2] a=1\n[2]\n[progress 7]\n[end 2]\n[error] boom\n"
        );
    }

    #[test]
    fn test_json_lines() {
        let mut buffer = Vec::new();
        {
            let mut json = JsonLinesExporter::new(&mut buffer);
            json.write(3, 0, "Patch", &attrs(&[("water", "1 mm")]))
                .unwrap();
        }
        let line = String::from_utf8(buffer).unwrap();
        assert!(line.contains("\"step\":3"));
        assert!(line.contains("\"entity\":\"Patch\""));
        assert!(line.ends_with('\n'));
    }
}
