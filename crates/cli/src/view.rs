//! Output rendering: one document to stdout, YAML by default.

use serde::Serialize;

use crate::args::OutputFormat;

pub fn write_output<T: Serialize>(format: OutputFormat, value: &T) -> anyhow::Result<()> {
    let rendered = render(format, value)?;
    print!("{rendered}");
    Ok(())
}

pub fn render<T: Serialize>(format: OutputFormat, value: &T) -> anyhow::Result<String> {
    let rendered = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        OutputFormat::Json => {
            let mut out = serde_json::to_string_pretty(value)?;
            out.push('\n');
            out
        }
    };
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::api::{MigrationEvent, MigrationEvents};

    fn events() -> MigrationEvents {
        MigrationEvents {
            events: vec![MigrationEvent {
                model_tag: "model-0f5a9c9e-1111-4222-8333-444455556666".to_string(),
                target_controller: "staging".to_string(),
                phase: "initiated".to_string(),
                message: "migration-1".to_string(),
                time: chrono_epoch(),
            }],
        }
    }

    fn chrono_epoch() -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(0, 0).expect("epoch")
    }

    #[test]
    fn yaml_output_is_a_document_stream() {
        let out = render(OutputFormat::Yaml, &events()).expect("yaml");
        assert!(out.contains("phase: initiated"));
        assert!(out.contains("target-controller: staging"));
    }

    #[test]
    fn json_output_is_pretty_printed() {
        let out = render(OutputFormat::Json, &events()).expect("json");
        assert!(out.contains("\"phase\": \"initiated\""));
        assert!(out.ends_with('\n'));
    }
}
