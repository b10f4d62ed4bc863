// ============================================================================
// MaskFE CLI: headless batch editing via command-line arguments
// ============================================================================
//
// Usage examples:
//   maskfe -i photo.png --script mask_sky.rhai -o result.png
//   maskfe -i photo.jpg -o out.png                    (format from output ext)
//   maskfe -i "shots/*.jpg" --script crop.rhai --output-dir processed/ --format png
//   maskfe -i photo.png --script mask.rhai --mask-output mask.png --project-output edit.mfe
//
// Each input is opened as a project, the script's requests are replayed
// through the undoable editor operations, then the result is written out.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use crate::io::{SaveFormat, encode_and_write};
use crate::ops::scripting::run_script;
use crate::project::Project;
use crate::settings::EditorSettings;

/// MaskFE headless editor.
///
/// Run Rhai edit scripts (select, mask, crop, generate) on image files.
#[derive(Parser, Debug)]
#[command(
    name = "maskfe",
    about = "MaskFE headless batch editor",
    long_about = "Run Rhai edit scripts on image files without a GUI. Scripts call\n\
                  select(), create_mask(), invert_mask(), crop(), generate() and friends;\n\
                  every call goes through the same undoable operations as the editor.\n\n\
                  Example:\n  \
                  maskfe --input photo.png --script mask.rhai --output result.png"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
    /// `.mfe` project files keep their layers, masks and origin.
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Rhai script to run on each input.
    #[arg(short, long, value_name = "SCRIPT.rhai")]
    pub script: Option<PathBuf>,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Output format: png, jpeg, webp, bmp, tga.
    /// When omitted, inferred from --output's extension, defaulting to png.
    #[arg(short, long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// Also write the active layer's mask as a grayscale PNG.
    #[arg(long, value_name = "FILE")]
    pub mask_output: Option<PathBuf>,

    /// Also save the edited document as an `.mfe` project.
    #[arg(long, value_name = "FILE")]
    pub project_output: Option<PathBuf>,

    /// JPEG quality (1–100). Defaults to the saved editor setting.
    #[arg(short, long, value_name = "1-100")]
    pub quality: Option<u8>,

    /// Undo depth for the edit session.
    #[arg(long, value_name = "N")]
    pub max_history: Option<usize>,

    /// Print script output, the undo stack and timings; mirror the log to stderr.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    let single_file_flags = args.output.is_some() || args.mask_output.is_some() || args.project_output.is_some();
    if inputs.len() > 1 && single_file_flags {
        eprintln!(
            "error: {} input files given but --output, --mask-output and --project-output \
             only accept a single file.\nUse --output-dir for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    let format = match parse_format(args.format.as_deref(), args.output.as_deref()) {
        Ok(f) => f,
        Err(msg) => {
            eprintln!("error: {}", msg);
            return ExitCode::FAILURE;
        }
    };

    let mut settings = EditorSettings::load();
    if let Some(q) = args.quality {
        settings.export_quality = q.clamp(1, 100);
    }
    if let Some(depth) = args.max_history {
        settings.max_undo_steps = depth.max(1);
    }

    let script_source = match &args.script {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(src) => Some(src),
            Err(e) => {
                eprintln!("error: could not read script '{}': {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("error: could not create output directory '{}': {}", dir.display(), e);
        return ExitCode::FAILURE;
    }

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }
        let file_start = Instant::now();

        let Some(output_path) =
            build_output_path(input_path, args.output.as_deref(), args.output_dir.as_deref(), format)
        else {
            eprintln!("  error: cannot determine output path for '{}'.", input_path.display());
            any_failure = true;
            continue;
        };

        let job = Job {
            input: input_path,
            output: &output_path,
            format,
            script: script_source.as_deref(),
            mask_output: args.mask_output.as_deref(),
            project_output: args.project_output.as_deref(),
            verbose: args.verbose,
        };
        match run_one(&job, settings.clone()) {
            Ok(()) => {
                if args.verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output_path.display(),
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                log_err!("{}: {}", input_path.display(), e);
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

struct Job<'a> {
    input: &'a Path,
    output: &'a Path,
    format: SaveFormat,
    script: Option<&'a str>,
    mask_output: Option<&'a Path>,
    project_output: Option<&'a Path>,
    verbose: bool,
}

fn run_one(job: &Job<'_>, settings: EditorSettings) -> Result<(), String> {
    let quality = settings.export_quality;
    let mut project = Project::open(job.input, settings).map_err(|e| format!("load failed: {}", e))?;

    if let Some(src) = job.script {
        let outcome = run_script(src, &mut project)
            .map_err(|e| format!("script error: {}", e.friendly_message()))?;
        if job.verbose {
            for line in &outcome.console_output {
                println!("  [script] {}", line);
            }
            for entry in project.history.undo_history() {
                println!("  [history] {}", entry);
            }
        }
    }

    let flat = project
        .export_composite()
        .map_err(|e| format!("export failed: {}", e))?;
    encode_and_write(&flat, job.output, job.format, quality).map_err(|e| format!("save failed: {}", e))?;

    if let Some(path) = job.mask_output {
        project.save_mask(path).map_err(|e| format!("mask save failed: {}", e))?;
    }
    if let Some(path) = job.project_output {
        project
            .save_project(path)
            .map_err(|e| format!("project save failed: {}", e))?;
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);
        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// `--format` wins, then the output extension, then PNG.
fn parse_format(format_arg: Option<&str>, output: Option<&Path>) -> Result<SaveFormat, String> {
    if let Some(f) = format_arg {
        return SaveFormat::from_name(f).ok_or_else(|| format!("unknown format '{}'", f));
    }
    Ok(output.and_then(SaveFormat::from_path).unwrap_or(SaveFormat::Png))
}

/// Priority: `--output`, then `--output-dir/<stem>.<ext>`, then next to the
/// input (with `_out` appended when that would overwrite it).
fn build_output_path(
    input: &Path,
    output: Option<&Path>,
    output_dir: Option<&Path>,
    format: SaveFormat,
) -> Option<PathBuf> {
    if let Some(out) = output {
        return Some(out.to_path_buf());
    }

    let ext = format.extension();
    let stem = input.file_stem()?.to_string_lossy().into_owned();

    if let Some(dir) = output_dir {
        return Some(dir.join(format!("{}.{}", stem, ext)));
    }

    let parent = input.parent().unwrap_or(Path::new("."));
    let candidate = parent.join(format!("{}.{}", stem, ext));
    if candidate == input {
        Some(parent.join(format!("{}_out.{}", stem, ext)))
    } else {
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_resolution_order() {
        assert_eq!(parse_format(Some("JPEG"), Some(Path::new("a.png"))), Ok(SaveFormat::Jpeg));
        assert_eq!(parse_format(None, Some(Path::new("a.bmp"))), Ok(SaveFormat::Bmp));
        assert_eq!(parse_format(None, None), Ok(SaveFormat::Png));
        assert!(parse_format(Some("gif"), None).is_err());
    }

    #[test]
    fn output_path_never_overwrites_input() {
        let p = build_output_path(Path::new("dir/photo.png"), None, None, SaveFormat::Png).unwrap();
        assert_eq!(p, PathBuf::from("dir/photo_out.png"));
        let p = build_output_path(Path::new("dir/photo.png"), None, Some(Path::new("out")), SaveFormat::Jpeg)
            .unwrap();
        assert_eq!(p, PathBuf::from("out/photo.jpg"));
    }

    #[test]
    fn args_parse() {
        let args = CliArgs::try_parse_from([
            "maskfe", "-i", "a.png", "-s", "edit.rhai", "--mask-output", "m.png", "-q", "80",
        ])
        .unwrap();
        assert_eq!(args.input, vec!["a.png".to_string()]);
        assert_eq!(args.quality, Some(80));
        assert_eq!(args.mask_output, Some(PathBuf::from("m.png")));
    }

    #[test]
    fn script_run_end_to_end() {
        let dir = std::env::temp_dir().join(format!("maskfe_cli_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("in.png");
        image::RgbaImage::from_pixel(64, 48, image::Rgba([200, 100, 50, 255]))
            .save(&input)
            .unwrap();
        let output = dir.join("out.png");
        let mask = dir.join("mask.png");
        let job = Job {
            input: &input,
            output: &output,
            format: SaveFormat::Png,
            script: Some("select(8, 8, 32, 24); create_mask(); crop(0, 0, 48, 40);"),
            mask_output: Some(&mask),
            project_output: None,
            verbose: false,
        };
        run_one(&job, EditorSettings::default()).unwrap();
        let out = image::open(&output).unwrap();
        assert_eq!((out.width(), out.height()), (48, 40));
        assert!(mask.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
