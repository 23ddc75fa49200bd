use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use messenger_core::{
    attestation::{AttestationClient, AttestationSource},
    chain_adapter::chain_emitter,
    config::ChainConfig,
    relayer::{RelayState, Relayer},
    types::create_nonce,
    verify::{GuardianSet, SignatureVerifier},
    wallet::{KeypairSigner, RpcEvmSigner, Wallets},
    vaa::Decoder,
    Attestation, ChainFamily, ChainId, Config, EmitterAddress, MessageId,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 验证并解析配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 发送消息并等待守护者签名
    Send {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
        /// 链名或链标识，例如 ethereum、bsc、solana、2
        #[arg(long)]
        chain: ChainId,
        /// 消息内容
        #[arg(short, long)]
        message: String,
        /// 默认随机生成
        #[arg(long)]
        nonce: Option<u32>,
    },
    /// 按 (链, 发送方, 序列号) 取回已签名的 VAA
    Fetch {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
        #[arg(long)]
        chain: ChainId,
        /// 32 字节十六进制发送方地址，默认使用配置中的 messenger 地址
        #[arg(long)]
        emitter: Option<String>,
        #[arg(long)]
        sequence: u64,
    },
    /// 解码 VAA（十六进制或 base64）
    Decode {
        vaa: String,
        /// 提供配置时按其中的守护者集合验证签名
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

fn chain_config(config: &Config, chain: ChainId) -> Result<&ChainConfig> {
    config
        .get_chain_config(chain)
        .ok_or_else(|| anyhow!("配置中没有链 {}", chain))
}

async fn connect_wallet(wallets: &Wallets, chain: &ChainConfig) -> Result<()> {
    match chain.family {
        ChainFamily::Evm => {
            let signer = RpcEvmSigner::new(&chain.rpc_url, chain.signer.account.as_deref())?;
            wallets.evm.connect(Arc::new(signer)).await;
        }
        ChainFamily::Solana => {
            let path = chain
                .signer
                .keypair_path
                .as_ref()
                .ok_or_else(|| anyhow!("链 {} 缺少 signer.keypair_path", chain.chain_id))?;
            wallets.solana.connect(Arc::new(KeypairSigner::from_file(path)?)).await;
        }
    }
    Ok(())
}

fn parse_vaa_input(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim();
    if let Ok(bytes) = hex::decode(trimmed.trim_start_matches("0x")) {
        return Ok(bytes);
    }
    STANDARD
        .decode(trimmed)
        .context("VAA 既不是十六进制也不是 base64")
}

fn describe(attestation: &Attestation) -> serde_json::Value {
    let chain = attestation.emitter_chain_id();
    json!({
        "id": attestation.message_id().map(|id| id.to_string()),
        "version": attestation.version,
        "guardianSetIndex": attestation.guardian_set_index,
        "signatures": attestation.signatures.len(),
        "timestamp": attestation.timestamp,
        "nonce": attestation.nonce,
        "emitterChain": attestation.emitter_chain,
        "emitterAddress": chain
            .map(|c| attestation.emitter_address.to_native(c))
            .unwrap_or_else(|| attestation.emitter_address.to_hex()),
        "sequence": attestation.sequence,
        "consistencyLevel": attestation.consistency_level,
        "payload": attestation.payload_text(),
        "hash": hex::encode(attestation.hash()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志，RUST_LOG 未设置时默认 info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ValidateConfig { config } => {
            info!("正在验证配置文件: {:?}", config);
            let config = Config::load(config)?;
            println!("配置文件验证成功!");
            println!("配置内容概要:");
            println!("- 支持的链:");
            for chain in &config.chains {
                println!(
                    "  - {} ({}, {}): {}",
                    chain.name,
                    chain.chain_id.to_u16(),
                    chain.family,
                    chain.rpc_url
                );
                println!("    发送方: {}", chain_emitter(chain)?);
            }
            println!("- 守护者节点:");
            for host in &config.attestation.hosts {
                println!("  - {}", host);
            }
            println!("- 重试策略:");
            println!(
                "  - 初始延迟: {}毫秒, 最大延迟: {}毫秒",
                config.attestation.initial_delay_ms, config.attestation.max_delay_ms
            );
            println!("  - 最大轮数: {}", config.attestation.max_attempts);
            println!("  - 截止时间: {}秒", config.attestation.deadline_secs);
            match &config.guardian_set {
                Some(set) => println!("- 守护者集合 {}: {} 个公钥", set.index, set.keys.len()),
                None => println!("- 未配置守护者集合，不验证签名"),
            }
            Ok(())
        }
        Commands::Send {
            config,
            chain,
            message,
            nonce,
        } => {
            let config = Config::load(config)?;
            let wallets = Wallets::default();
            connect_wallet(&wallets, chain_config(&config, chain)?).await?;

            let relayer = Arc::new(Relayer::new(&config, wallets)?);
            let nonce = nonce.unwrap_or_else(create_nonce);
            info!("正在向 {} 发送消息 (nonce {})", chain, nonce);

            let handle = relayer.spawn(chain, message.into_bytes(), nonce);
            let mut state = handle.watch();
            let progress = async {
                while state.changed().await.is_ok() {
                    let current = state.borrow_and_update().clone();
                    match current {
                        RelayState::AwaitingAttestation(submitted) => {
                            println!("交易已确认: {}", submitted.transaction);
                            println!("等待守护者签名: {}", submitted.id);
                        }
                        RelayState::Decoding(_) => println!("正在解码 VAA..."),
                        other if other.is_terminal() => break,
                        _ => {}
                    }
                }
            };
            tokio::select! {
                _ = progress => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("收到中断信号，放弃等待");
                    handle.abandon();
                }
            }

            match handle.wait().await {
                Ok(attestation) => {
                    println!("消息已送达!");
                    println!("{}", serde_json::to_string_pretty(&describe(&attestation))?);
                    Ok(())
                }
                Err(failure) => {
                    if let Some(transaction) = &failure.transaction {
                        println!("注意: 交易 {} 已广播，费用不可退回", transaction);
                    }
                    Err(failure.into())
                }
            }
        }
        Commands::Fetch {
            config,
            chain,
            emitter,
            sequence,
        } => {
            let config = Config::load(config)?;
            let emitter = match emitter {
                Some(emitter) => emitter.parse::<EmitterAddress>()?,
                None => chain_emitter(chain_config(&config, chain)?)?,
            };
            let id = MessageId::new(chain, emitter, sequence);
            let client = AttestationClient::from_config(&config.attestation)?;
            let bytes = client.fetch(&id).await?;
            println!("{}", hex::encode(&bytes));
            Ok(())
        }
        Commands::Decode { vaa, config } => {
            let bytes = parse_vaa_input(&vaa)?;
            let guardian_set = match config {
                Some(path) => Config::load(path)?
                    .guardian_set
                    .as_ref()
                    .map(GuardianSet::from_config)
                    .transpose()?,
                None => None,
            };

            let decoder = guardian_set
                .as_ref()
                .map(|set| Decoder::new(set.len()))
                .unwrap_or_default();
            let attestation = decoder.decode(&bytes)?;
            println!("{}", serde_json::to_string_pretty(&describe(&attestation))?);

            if let Some(set) = guardian_set {
                let valid = SignatureVerifier::new(set).verify(&attestation)?;
                println!("签名验证通过: {} 个有效签名", valid);
            } else {
                println!("未配置守护者集合，跳过签名验证");
            }
            if attestation.emitter_chain_id().is_none() {
                bail!("不支持的发送链: {}", attestation.emitter_chain);
            }
            Ok(())
        }
    }
}
