// CLI commands for building and inspecting Crucible datasets
use anyhow::{bail, Context, Result};
use crucible_common::dataset::DatasetStore;
use crucible_common::types::Task;
use std::fs;
use std::path::{Path, PathBuf};

const PROMPT_FILES: [&str; 2] = ["prompt.md", "prompt.txt"];
const BACKBONE_STEM: &str = "backbone";

/// A corpus directory that could not become a task
#[derive(Debug, Clone, PartialEq)]
pub struct Skipped {
    pub dir: PathBuf,
    pub reason: String,
}

/// Read one task from a corpus subdirectory
fn read_task_dir(dir: &Path) -> Result<std::result::Result<Task, String>> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .context("Corpus directory name is not valid UTF-8")?
        .to_string();

    let Some(prompt_path) = PROMPT_FILES.iter().map(|f| dir.join(f)).find(|p| p.is_file()) else {
        return Ok(Err("no prompt.md or prompt.txt".to_string()));
    };

    let mut backbones = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        let is_backbone = path.is_file()
            && path.file_stem().and_then(|s| s.to_str()) == Some(BACKBONE_STEM)
            && path.extension().is_some();
        if is_backbone {
            backbones.push(path);
        }
    }
    backbones.sort();

    let backbone_path = match backbones.as_slice() {
        [] => return Ok(Err("no backbone.<ext> file".to_string())),
        [one] => one,
        _ => return Ok(Err("more than one backbone.<ext> file".to_string())),
    };

    let prompt = fs::read_to_string(&prompt_path)
        .with_context(|| format!("Failed to read {}", prompt_path.display()))?;
    let backbone = fs::read_to_string(backbone_path)
        .with_context(|| format!("Failed to read {}", backbone_path.display()))?;

    Ok(Ok(Task::new(name, prompt.trim_end(), backbone)))
}

/// Turn every subdirectory of `corpus` into a task, sorted by name
pub fn collect_tasks(corpus: &Path) -> Result<(Vec<Task>, Vec<Skipped>)> {
    if !corpus.is_dir() {
        bail!("Corpus directory not found: {}", corpus.display());
    }

    let mut dirs = Vec::new();
    for entry in fs::read_dir(corpus).with_context(|| format!("Failed to list {}", corpus.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();

    let mut tasks = Vec::new();
    let mut skipped = Vec::new();
    for dir in dirs {
        match read_task_dir(&dir)? {
            Ok(task) => tasks.push(task),
            Err(reason) => skipped.push(Skipped { dir, reason }),
        }
    }

    Ok((tasks, skipped))
}

/// Build a fresh dataset from a corpus of task directories
pub async fn init_dataset(corpus: &Path, output: &Path, force: bool) -> Result<()> {
    println!("🚀 Building dataset from: {}", corpus.display());

    if output.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite it",
            output.display()
        );
    }

    let (tasks, skipped) = collect_tasks(corpus)?;

    for skip in &skipped {
        println!("  ⚠️  Skipped {}: {}", skip.dir.display(), skip.reason);
    }
    for task in &tasks {
        println!("  ✅ {}", task.name);
    }

    if tasks.is_empty() {
        bail!("No tasks found in {}", corpus.display());
    }

    DatasetStore::new(output)
        .save(&tasks)
        .context("Failed to write dataset")?;

    println!("\n✅ Dataset written with {} task(s)", tasks.len());
    println!("📂 Output: {}", output.display());
    println!("\n📋 Next steps:");
    println!("  1. Generate completions: crucible-worker --dataset {} complete", output.display());
    println!("  2. Generate test suites: crucible-worker --dataset {} design-tests", output.display());
    println!("  3. Run rounds:           crucible-worker --dataset {} evaluate", output.display());
    Ok(())
}

/// Print per-task status and accuracy
pub async fn report(dataset: &Path) -> Result<()> {
    let tasks = DatasetStore::new(dataset).load()?;

    if tasks.is_empty() {
        println!("Dataset is empty.");
        return Ok(());
    }

    println!("📋 Tasks in {}:\n", dataset.display());
    println!(
        "{:<30} {:<22} {:>9} {:>9} {:>7}",
        "TASK", "STATUS", "ACCURACY", "ATTEMPTS", "PASSED"
    );
    println!("{}", "─".repeat(81));

    for task in &tasks {
        println!(
            "{:<30} {:<22} {:>9.3} {:>9} {:>7}",
            task.name,
            task.status.to_string(),
            task.report_accuracy,
            task.completion_list.len(),
            if task.passed { "yes" } else { "no" }
        );
    }

    let passed = tasks.iter().filter(|t| t.passed).count();
    let mean = tasks.iter().map(|t| t.report_accuracy).sum::<f64>() / tasks.len() as f64;
    println!(
        "\n✅ {}/{} passed, mean accuracy {:.3}",
        passed,
        tasks.len(),
        mean
    );
    Ok(())
}

/// Invariant violations, one line each
pub fn find_violations(tasks: &[Task]) -> Vec<String> {
    let mut violations = Vec::new();

    for (index, task) in tasks.iter().enumerate() {
        let label = format!("#{} {}", index, task.name);

        if !(0.0..=1.0).contains(&task.report_accuracy) {
            violations.push(format!("{}: report_accuracy {} outside [0, 1]", label, task.report_accuracy));
        }
        if task.passed != (task.report_accuracy == 1.0) {
            violations.push(format!(
                "{}: passed={} disagrees with report_accuracy {}",
                label, task.passed, task.report_accuracy
            ));
        }
        if let Err(e) = task.attempts() {
            violations.push(format!("{}: {}", label, e));
        }
        if task
            .attempt_accuracies
            .iter()
            .any(|a| !(0.0..=1.0).contains(a))
        {
            violations.push(format!("{}: attempt accuracy outside [0, 1]", label));
        }
    }

    violations
}

/// Check dataset invariants; fails when any is violated
pub async fn validate(dataset: &Path) -> Result<()> {
    let tasks = DatasetStore::new(dataset).load()?;
    let violations = find_violations(&tasks);

    if violations.is_empty() {
        println!("✅ {} task(s) valid", tasks.len());
        return Ok(());
    }

    for violation in &violations {
        println!("  ❌ {}", violation);
    }
    bail!("{} invariant violation(s) in {}", violations.len(), dataset.display())
}
