use clap::{Arg, ArgAction, Command};
use rustgrid::engine::session::{halt_session, inspect_session, latest_session_id, GridSession};
use rustgrid::{
    core::config::{GridConfig, OrderSizeMode},
    core::error::GridError,
    core::gateway::ExchangeGateway,
    core::types::{OrderSide, SpacingMode},
    engine::{build_ladder, estimate_cycle_profit, select_pair},
    exchanges::create_gateway,
    persist::{NullSink, RestSink, SinkHandle},
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载环境变量
    dotenv::dotenv().ok();

    // 解析命令行参数
    let matches = Command::new("RustGrid")
        .version("0.1.0")
        .about("Rust网格交易系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .required(true),
        )
        .subcommand_required(true)
        .subcommand(Command::new("setup").about("校验配置，预览网格阶梯与每周期收益估算"))
        .subcommand(
            Command::new("dry-run")
                .about("纸面撮合模拟运行，不触碰真实交易所")
                .arg(
                    Arg::new("cycles")
                        .long("cycles")
                        .value_name("N")
                        .help("模拟的轮询周期数")
                        .default_value("5"),
                ),
        )
        .subcommand(
            Command::new("start")
                .about("启动交易会话")
                .arg(
                    Arg::new("resume")
                        .long("resume")
                        .action(ArgAction::SetTrue)
                        .help("恢复最近一次会话而不是新建"),
                )
                .arg(
                    Arg::new("session")
                        .long("session")
                        .value_name("ID")
                        .help("恢复指定会话，隐含--resume"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("查看会话状态与账户余额")
                .arg(
                    Arg::new("session")
                        .long("session")
                        .value_name("ID")
                        .help("会话ID，缺省取最近一次"),
                ),
        )
        .subcommand(
            Command::new("stop")
                .about("撤掉全部挂单并停止会话")
                .arg(
                    Arg::new("session")
                        .long("session")
                        .value_name("ID")
                        .help("会话ID，缺省取最近一次"),
                ),
        )
        .get_matches();

    let config_file = matches.get_one::<String>("config").unwrap();

    // 读取配置并校验
    let mut config = GridConfig::from_file(config_file)?;
    config.validate()?;

    // 从配置中获取日志级别，默认为info
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    std::env::set_var("RUST_LOG", &log_level);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    let (command, sub) = matches
        .subcommand()
        .expect("subcommand_required保证存在子命令");
    log::info!(
        "启动命令: {} with config: {}, 日志级别: {}",
        command,
        config_file,
        log_level
    );

    match command {
        "setup" => {
            let gateway = build_gateway(&config)?;
            let pair = select_pair(&config, gateway.as_ref()).await?;

            println!("\n============================================================");
            println!("RustGrid - 配置检查");
            println!("============================================================\n");
            println!("活动名称:     {}", config.campaign.name);
            println!("交易所:       {}", config.campaign.exchange);
            println!("交易对:       {}", pair);
            println!(
                "网格区间:     [{:.2}, {:.2}]",
                config.grid.lower_bound, config.grid.upper_bound
            );
            let spacing_desc = match config.grid.spacing_mode {
                SpacingMode::Arithmetic => format!("等差 {:.2}", config.grid.spacing_value),
                SpacingMode::Geometric => format!("等比 x{}", config.grid.spacing_value),
            };
            println!("网格间距:     {}", spacing_desc);
            let size_desc = match config.grid.order_size.mode {
                OrderSizeMode::Base => format!("{} (基础币)", config.grid.order_size.value),
                OrderSizeMode::Quote => format!("{} (计价币)", config.grid.order_size.value),
            };
            println!("单笔规模:     {}", size_desc);
            println!("轮询间隔:     {}s", config.execution.poll_interval_secs);
            println!("日亏损上限:   {:.2}", config.risk.max_daily_loss);
            println!("持仓敞口上限: {:.2}", config.risk.max_position);

            let ticker = gateway.get_ticker(&pair).await?;
            let reference_price = ticker.last;
            println!(
                "\n参考价:       {:.2} (买一 {:.2} / 卖一 {:.2})",
                reference_price, ticker.bid, ticker.ask
            );

            let ladder = build_ladder(&config, reference_price)?;
            println!(
                "网格阶梯:     共{}档 = 买{}档 + 卖{}档",
                ladder.len(),
                ladder.buy_levels().count(),
                ladder.sell_levels().count()
            );
            for (i, level) in ladder.levels().iter().enumerate() {
                let prefix = if i + 1 == ladder.len() { "└─" } else { "├─" };
                let side = match level.side {
                    OrderSide::Buy => "买",
                    OrderSide::Sell => "卖",
                };
                println!("  {} L{:<3} {} {:.2}", prefix, level.index, side, level.price);
            }
            if reference_price < config.grid.lower_bound {
                log::warn!("⚠️ 参考价低于网格下界，开局将全部是卖档");
            } else if reference_price > config.grid.upper_bound {
                log::warn!("⚠️ 参考价高于网格上界，开局将全部是买档");
            }

            match estimate_cycle_profit(&config, &ladder) {
                Some(estimate) => {
                    println!(
                        "\n每周期收益估算 (费率 {:.4}):",
                        config.effective_fee_rate()
                    );
                    println!(
                        "  买入 {:.2} → 卖出 {:.2}, 数量 {:.8}",
                        estimate.buy_price, estimate.sell_price, estimate.quantity
                    );
                    println!(
                        "  毛利 {:.4} - 手续费 {:.4} = 净利 {:.4}",
                        estimate.gross_profit, estimate.fees, estimate.net_profit
                    );
                    if estimate.net_profit <= 0.0 {
                        log::warn!("⚠️ 每周期净利为负，网格间距对当前费率而言过小");
                    }
                }
                None => log::warn!("⚠️ 参考价下没有成对的买卖档，无法估算每周期收益"),
            }

            println!("\n✓ 配置检查通过，可运行 dry-run 或 start");
        }
        "dry-run" => {
            let cycles: u64 = sub.get_one::<String>("cycles").unwrap().parse()?;
            // 无论配置怎么写，dry-run一律走纸面撮合
            config.execution.dry_run = true;

            let gateway = build_gateway(&config)?;
            let pair = select_pair(&config, gateway.as_ref()).await?;
            let config = Arc::new(config);
            let (sink, sink_task) = build_sink(&config);

            let session = GridSession::create(config.clone(), pair, gateway, sink).await?;
            log::info!("🔄 纸面模拟{}个周期后自动停止", cycles);
            session.run_cycles(cycles).await?;

            println!("{}", session.report().await.render());
            drop(session);
            let _ = sink_task.await;
        }
        "start" => {
            let gateway = build_gateway(&config)?;
            let resume = if let Some(id) = sub.get_one::<String>("session") {
                Some(id.clone())
            } else if sub.get_flag("resume") {
                Some(latest_session_id(&config.journal.dir).ok_or_else(|| {
                    GridError::Other(format!(
                        "目录{}下没有可恢复的会话日志",
                        config.journal.dir
                    ))
                })?)
            } else {
                None
            };

            let config = Arc::new(config);
            let (sink, sink_task) = build_sink(&config);
            let session = match resume {
                Some(session_id) => {
                    log::info!("🔄 从会话{}恢复", session_id);
                    GridSession::recover(config.clone(), &session_id, gateway, sink).await?
                }
                None => {
                    let pair = select_pair(&config, gateway.as_ref()).await?;
                    GridSession::create(config.clone(), pair, gateway, sink).await?
                }
            };
            let session = Arc::new(session);

            let mut runner = {
                let session = session.clone();
                tokio::spawn(async move { session.run().await })
            };

            // 保持运行直到收到停止信号，或循环因日志写入失败自行退出
            tokio::select! {
                result = &mut runner => {
                    result??;
                    log::warn!("⚠️ 交易循环已自行退出");
                }
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    log::info!("收到停止信号，正在关闭会话...");
                    session.request_stop().await;
                    runner.await??;
                }
            }

            println!("{}", session.report().await.render());
            drop(session);
            let _ = sink_task.await;
        }
        "status" => {
            let session_id = resolve_session_id(sub, &config)?;
            let gateway = build_gateway(&config)?;
            let overview = inspect_session(&config, &session_id, gateway.as_ref()).await?;
            println!("{}", overview.render());

            match gateway.get_balances().await {
                Ok(balances) => {
                    println!("\n账户余额:");
                    for balance in balances {
                        println!(
                            "  {:<8} 总额 {:.8} 可用 {:.8}",
                            balance.currency, balance.total, balance.free
                        );
                    }
                }
                Err(e) => log::warn!("⚠️ 获取余额失败: {}", e),
            }
        }
        "stop" => {
            let session_id = resolve_session_id(sub, &config)?;
            let gateway = build_gateway(&config)?;
            let summary = halt_session(&config, &session_id, gateway.as_ref()).await?;

            println!("✓ 会话{}已停止，撤销{}笔挂单", session_id, summary.cancelled);
            println!(
                "  持仓 {:.8} | 已实现 {:.4} | 手续费 {:.4}",
                summary.snapshot.inventory,
                summary.snapshot.realized_pnl,
                summary.snapshot.fees_paid
            );
            println!("  成交明细已导出: {}", summary.csv_path.display());
        }
        other => {
            log::error!("未知子命令: {}", other);
            return Err(format!("未知子命令: {}", other).into());
        }
    }

    Ok(())
}

/// 网关种子交易对：固定交易对或首个候选，validate()已保证至少一项存在
fn build_gateway(config: &GridConfig) -> Result<Arc<dyn ExchangeGateway>, GridError> {
    let seed = config
        .resolved_pair()
        .or_else(|| config.pair.pairs.first().map(String::as_str))
        .ok_or_else(|| {
            GridError::ConfigError("必须配置 pair.trading_pair 或候选 pair.pairs".to_string())
        })?;
    create_gateway(config, seed)
}

/// 配置了persistence就镜像到REST服务，否则空实现
fn build_sink(config: &GridConfig) -> (SinkHandle, tokio::task::JoinHandle<()>) {
    match &config.persistence {
        Some(params) => {
            log::info!("📡 状态镜像指向 {}", params.base_url);
            SinkHandle::spawn(
                Arc::new(RestSink::new(params)),
                Duration::from_secs(params.timeout_secs),
            )
        }
        None => SinkHandle::spawn(Arc::new(NullSink), Duration::from_secs(3)),
    }
}

fn resolve_session_id(
    matches: &clap::ArgMatches,
    config: &GridConfig,
) -> Result<String, GridError> {
    if let Some(id) = matches.get_one::<String>("session") {
        return Ok(id.clone());
    }
    latest_session_id(&config.journal.dir)
        .ok_or_else(|| GridError::Other(format!("目录{}下没有会话日志", config.journal.dir)))
}
