//! Interface de terminal do partchain: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`OrderProgress`] acompanha visualmente
//! a execução de uma batch order no terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::batch::{Batch, BatchOrder, FailurePolicy};
use crate::state_machine::{JobState, ProcessingState};

/// Estilo de cor para um estado de processamento.
fn state_style(state: ProcessingState) -> Style {
    match state {
        ProcessingState::Completed => Style::new().green().bold(),
        ProcessingState::Error => Style::new().red().bold(),
        ProcessingState::Processing => Style::new().yellow(),
        ProcessingState::Created => Style::new().dim(),
    }
}

fn job_style(state: JobState) -> Style {
    match state {
        JobState::Completed => Style::new().green(),
        s if s.is_failure() => Style::new().red(),
        _ => Style::new().yellow(),
    }
}

/// Indicador visual de progresso para uma batch order no terminal.
///
/// A barra avança a cada job terminal; a mensagem mostra a batch em execução.
pub struct OrderProgress {
    pb: ProgressBar,
}

impl OrderProgress {
    /// Inicia a barra com o total de jobs da order.
    pub fn start(order: &BatchOrder, total_jobs: usize) -> Self {
        let pb = ProgressBar::new(total_jobs as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} jobs {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.set_message(format!("order {}", order.batch_order_id));
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    /// Atualiza a barra a partir das batches atuais da order.
    pub fn update(&self, batches: &[Batch]) {
        let finished = batches
            .iter()
            .flat_map(|b| b.job_progress.iter())
            .filter(|p| p.is_terminal())
            .count();
        self.pb.set_position(finished as u64);

        if let Some(running) = batches.iter().find(|b| b.batch_state == ProcessingState::Processing) {
            self.pb
                .set_message(format!("batch {}/{}", running.batch_number, running.batch_total));
        }
    }

    /// Finaliza a barra e exibe o estado final da order.
    pub fn finish(&self, order: &BatchOrder) {
        self.pb.finish_and_clear();
        let style = state_style(order.batch_order_state);
        let mark = match order.batch_order_state {
            ProcessingState::Completed => "✓",
            ProcessingState::Error => "✗",
            _ => "…",
        };
        println!(
            "  {} Order {} {}",
            style.apply_to(mark),
            order.batch_order_id,
            style.apply_to(order.batch_order_state)
        );
    }
}

fn policy_label(policy: FailurePolicy) -> &'static str {
    match policy {
        FailurePolicy::CollectAll => "collect-all",
        FailurePolicy::FailFast => "fail-fast",
    }
}

/// Imprime uma linha por batch order salva.
pub fn print_orders(orders: &[BatchOrder]) {
    if orders.is_empty() {
        println!("No batch orders stored.");
        return;
    }
    for order in orders {
        println!(
            "{}  {:<10}  {:<11}  created {}",
            order.batch_order_id,
            state_style(order.batch_order_state).apply_to(order.batch_order_state),
            policy_label(order.failure_policy),
            order.created_on.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}

/// Imprime as batches de uma order com o estado de cada job.
pub fn print_batches(batches: &[Batch]) {
    if batches.is_empty() {
        println!("No batches stored for this order.");
        return;
    }
    let dim = Style::new().dim();
    for batch in batches {
        println!(
            "Batch {}/{} {} {}",
            batch.batch_number,
            batch.batch_total,
            batch.batch_id,
            state_style(batch.batch_state).apply_to(batch.batch_state)
        );
        println!("  {}", dim.apply_to(&batch.batch_url));
        for progress in &batch.job_progress {
            println!(
                "  {:<40} {}",
                progress.key.global_asset_id,
                job_style(progress.job_state).apply_to(progress.job_state)
            );
        }
    }
}
