//! # Command line interface for `varmat`
use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::{PRE_READ_MAX_SIZE, VARS_PER_CHUNK};

#[derive(Parser)]
#[command(
    name = "vcf_to_varmat",
    author,
    version,
    about = "Transforms a VCF stream into a chunked columnar variation store",
    long_about = None
)]
pub struct Cli {
    /// Input VCF file. Reads stdin when omitted or '-'; '.gz' paths are
    /// decompressed transparently.
    pub input: Option<String>,

    /// Output store directory
    #[arg(short, long)]
    pub output: String,

    /// Fields to write to the store (all fields when unset)
    #[arg(long = "kept-fields", num_args = 1..)]
    pub kept_fields: Option<Vec<String>>,

    /// Fields to avoid writing to the store
    #[arg(long = "ignored-fields", num_args = 1..)]
    pub ignored_fields: Option<Vec<String>>,

    /// Skip variations with more alternate alleles than --alt-gt-num
    #[arg(long)]
    pub ignore_alt: bool,

    /// Maximum number of alternate alleles per variation. Required with
    /// --ignore-alt
    #[arg(long)]
    pub alt_gt_num: Option<usize>,

    /// Bytes of parsed records to buffer while discovering column widths
    #[arg(long, default_value_t = PRE_READ_MAX_SIZE)]
    pub pre_read_max_size: usize,

    /// Variations per chunk in the output store
    #[arg(long, default_value_t = VARS_PER_CHUNK)]
    pub chunk_size: usize,

    /// Number of parser worker threads
    #[arg(long, default_value_t = 1, value_parser = threads_in_range)]
    pub threads: usize,
}

impl Cli {
    pub fn validate(&self) -> Result<()> {
        if self.ignore_alt && self.alt_gt_num.is_none() {
            bail!("--alt-gt-num is required when --ignore-alt is set");
        }
        if self.chunk_size == 0 {
            bail!("--chunk-size must be at least 1");
        }
        Ok(())
    }
}

fn threads_in_range(s: &str) -> Result<usize> {
    let threads = s
        .parse()
        .context("Could not parse value passed to --threads to integer")?;
    if threads < 1 {
        bail!("--threads must be at least 1");
    }
    Ok(threads)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_alt_needs_alt_gt_num() {
        let cli = Cli::parse_from(["vcf_to_varmat", "-o", "out", "--ignore-alt"]);
        assert!(cli.validate().is_err());
        let cli = Cli::parse_from([
            "vcf_to_varmat",
            "-o",
            "out",
            "--ignore-alt",
            "--alt-gt-num",
            "3",
        ]);
        assert!(cli.validate().is_ok());
        assert_eq!(cli.alt_gt_num, Some(3));
    }

    #[test]
    fn stdin_is_the_default_input() {
        let cli = Cli::parse_from(["vcf_to_varmat", "-o", "out"]);
        assert!(cli.input.is_none());
        let cli = Cli::parse_from(["vcf_to_varmat", "-", "-o", "out"]);
        assert_eq!(cli.input.as_deref(), Some("-"));
    }
}
