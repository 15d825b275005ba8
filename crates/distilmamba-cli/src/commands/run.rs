//! `distilmamba run`: teacher fine-tuning, distillation, final statistics.

use anyhow::{Context, Result};
use tracing::{info, warn};

use distilmamba_train::evaluate;
use distilmamba_train::presets::approx_params;

use super::{print_report, Session};
use crate::commands::{distill, train_teacher};
use crate::config::AppConfig;

pub async fn run(config: &AppConfig) -> Result<()> {
    let mut session = Session::prepare(config).await?;

    println!("Phase 1: fine-tuning the teacher");
    let (trained, teacher_stats) = train_teacher::train(&mut session, config)?;

    let teacher = match &teacher_stats.checkpoint {
        Some(path) => {
            let best = session.classifier(&session.teacher_config)?;
            best.load(path)
                .with_context(|| format!("Cannot reload best teacher from {}", path.display()))?;
            info!(path = %path.display(), "Best teacher reloaded");
            best
        }
        None => {
            warn!("No teacher epoch scored above zero; distilling from the last in-memory teacher");
            trained
        }
    };

    println!("Phase 2: distilling into the student");
    let mut outcome = distill::distill(&mut session, teacher, teacher_stats.checkpoint.clone(), config)?;

    println!("Phase 3: final statistics");
    let teacher_report = evaluate(&mut outcome.teacher, &mut session.eval).context("Final teacher evaluation failed")?;
    let student_report = evaluate(&mut outcome.student, &mut session.eval).context("Final student evaluation failed")?;
    print_report("Teacher", &teacher_report);
    print_report("Student", &student_report);

    let manifest = outcome.write_manifest(&session, config)?;

    let teacher_params = approx_params(&session.teacher_config);
    let student_params = approx_params(&outcome.student_config);
    println!(
        "\nParameters: teacher ~{:.1}M, student ~{:.1}M ({:.1}x smaller)",
        teacher_params as f64 / 1e6,
        student_params as f64 / 1e6,
        teacher_params as f64 / student_params.max(1) as f64,
    );
    println!(
        "Best accuracy: teacher {:.4}, student {:.4}\nManifest: {}",
        teacher_stats.best_accuracy,
        outcome.stats.best_accuracy,
        manifest.display()
    );
    Ok(())
}
