//! Interface de linha de comando do partchain baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, orders, batches)
//! e flags globais (--config, --log-level, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

/// partchain: resolução assíncrona de cadeias de peças em lotes.
#[derive(Debug, Parser)]
#[command(name = "partchain", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para o arquivo de configuração (padrão: ./partchain.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Nível de log; tem precedência sobre PARTCHAIN_LOG.
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa uma batch order simulada contra o conector embutido.
    Demo {
        /// Quantidade de peças raiz na order.
        #[arg(long, default_value_t = 12)]
        parts: usize,

        /// Tamanho de cada batch (padrão: default_batch_size da configuração).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Profundidade máxima de resolução de cada job.
        #[arg(long, default_value_t = 2)]
        depth: u32,

        /// Filhos por peça na árvore simulada.
        #[arg(long, default_value_t = 2)]
        fanout: usize,

        /// Latência simulada de cada negociação, em milissegundos.
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,

        /// Índices (base 0) das peças raiz cuja negociação termina em TERMINATED.
        #[arg(long, value_delimiter = ',')]
        fail: Vec<usize>,

        /// Falha a order assim que uma batch falhar.
        #[arg(long, default_value_t = false)]
        fail_fast: bool,

        /// URL de callback, com placeholders {orderId}, {batchId}, {orderState}, {batchState}.
        #[arg(long)]
        callback_url: Option<String>,

        /// Mantém os snapshots só em memória.
        #[arg(long, default_value_t = false)]
        in_memory: bool,
    },

    /// Lista as batch orders salvas.
    Orders,

    /// Mostra as batches de uma order salva.
    Batches {
        /// Id da batch order.
        order_id: Uuid,
    },
}
