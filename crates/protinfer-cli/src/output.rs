use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use protinfer_core::graph::IdGraph;
use protinfer_core::infer::InferenceReport;

use crate::Runner;

impl Runner {
    // Create a path for `file_name` in the configured output directory
    fn make_path<S: AsRef<str>>(&self, file_name: S) -> PathBuf {
        self.parameters.output_directory.join(file_name.as_ref())
    }

    pub fn write_products(
        &self,
        graph: &IdGraph,
        report: &InferenceReport,
    ) -> anyhow::Result<Vec<String>> {
        Ok(vec![
            self.write_proteins(graph, report)?,
            self.write_report(report)?,
        ])
    }

    /// Tab-separated protein table: accession, target/decoy label,
    /// posterior, and the indistinguishable group the protein belongs to.
    fn write_proteins(&self, graph: &IdGraph, report: &InferenceReport) -> anyhow::Result<String> {
        let path = self.make_path("proteins.protinfer.tsv");
        let mut group_of: HashMap<&str, usize> = HashMap::new();
        for (i, group) in report.groups.iter().enumerate() {
            for accession in &group.accessions {
                group_of.insert(accession.as_str(), i);
            }
        }

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(&path)
            .with_context(|| format!("failed to create `{}`", path.display()))?;
        let headers = ["accession", "label", "posterior", "group"];
        writer.write_record(headers)?;

        let mut hits = graph.protein_hits();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        for hit in &hits {
            let mut record = csv::ByteRecord::new();
            record.push_field(hit.accession.as_bytes());
            record.push_field(itoa::Buffer::new().format(if hit.decoy { -1 } else { 1 }).as_bytes());
            record.push_field(ryu::Buffer::new().format(hit.score).as_bytes());
            match group_of.get(hit.accession.as_str()) {
                Some(&g) => record.push_field(itoa::Buffer::new().format(g).as_bytes()),
                None => record.push_field(b"-"),
            }
            writer.write_byte_record(&record)?;
        }
        writer.flush()?;
        Ok(path.display().to_string())
    }

    /// Run summary: effective parameters, the chosen grid point, group
    /// records, and convergence diagnostics.
    fn write_report(&self, report: &InferenceReport) -> anyhow::Result<String> {
        let path = self.make_path("results.json");
        let unconverged: Vec<usize> = report.outcome.warnings.iter().map(|w| w.cc).collect();
        let failed: Vec<usize> = report.outcome.failures.iter().map(|f| f.cc).collect();
        let body = serde_json::json!({
            "parameters": &self.parameters,
            "best_grid_point": &report.best,
            "indistinguishable_groups": &report.groups,
            "unconverged_components": unconverged,
            "failed_components": failed,
        });
        std::fs::write(&path, serde_json::to_vec_pretty(&body)?)
            .with_context(|| format!("failed to write `{}`", path.display()))?;
        Ok(path.display().to_string())
    }
}
