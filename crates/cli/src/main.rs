use clap::{Args, Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use storyloom_adapters::{AdapterError, CompletionClient, JsonProjectStore};
use storyloom_core::{
    ChapterError, ConfigError, ConfigStore, GenerationSettings, LogProgressSink, NewProject,
    Project, ProjectStore, PromptError, PromptRegistry, QualityContext, QualityReport,
    StageFailure, StageOrchestrator, StageOutcome, StageRequest, StoreError, StreamEvent,
    StreamSink,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

static PROGRESS: LogProgressSink = LogProgressSink;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run().await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("收到中断信号，正在取消当前请求……");
            trigger.cancel();
        }
    });

    let invocation = Invocation {
        config_path: cli.config,
        stream: ConsoleStream::new(cli.echo),
        cancel,
    };

    match cli.command {
        Command::Project(command) => handle_project(&invocation, command).await,
        Command::Architecture(command) => handle_architecture(&invocation, command).await,
        Command::Blueprint(command) => handle_blueprint(&invocation, command).await,
        Command::Chapter(command) => handle_chapter(&invocation, command).await,
        Command::Export(args) => run_export(&invocation, args).await,
        Command::Models(args) => run_list_models(&invocation, args).await,
    }
}

/// Options shared by every subcommand.
struct Invocation {
    config_path: PathBuf,
    stream: ConsoleStream,
    cancel: CancellationToken,
}

/// Echoes streamed output to stdout when enabled. Attaching it at all keeps
/// requests in streaming mode, which is the mode that retries.
struct ConsoleStream {
    echo: bool,
    mid_line: Mutex<bool>,
}

impl ConsoleStream {
    fn new(echo: bool) -> Self {
        Self {
            echo,
            mid_line: Mutex::new(false),
        }
    }
}

impl StreamSink for ConsoleStream {
    fn on_stream(&self, event: StreamEvent<'_>) {
        if !self.echo {
            return;
        }
        let Ok(mut mid_line) = self.mid_line.lock() else {
            return;
        };
        if let Err(err) = echo_event(&mut io::stdout().lock(), event, &mut mid_line) {
            log::warn!("写入标准输出失败：{err}");
        }
    }
}

/// Writes one stream event. A retried attempt restarts on a fresh line.
fn echo_event(
    out: &mut impl Write,
    event: StreamEvent<'_>,
    mid_line: &mut bool,
) -> io::Result<()> {
    if event.is_final() {
        writeln!(out)?;
        *mid_line = false;
    } else {
        if event.starts_request() && *mid_line {
            log::warn!("请求已重试，重新输出内容");
            writeln!(out)?;
        }
        write!(out, "{}", event.increment)?;
        *mid_line = true;
    }
    out.flush()
}

/// Everything needed to run generation stages against the stored projects.
struct Session {
    config: ConfigStore,
    profile: String,
    settings: GenerationSettings,
    prompts: PromptRegistry,
    client: CompletionClient,
    projects: JsonProjectStore,
}

impl Session {
    async fn open(config_path: &Path, preferred: Option<String>) -> Result<Self, CliError> {
        let mut config = ConfigStore::open(config_path.to_path_buf())?;
        config.ensure_recent_defaults();

        let profile = select_llm_interface(&config, preferred)?;
        let settings = config.config().generation_settings(Some(&profile))?;
        let prompts = PromptRegistry::from_prompt_config(&config.config().prompts)?;
        let client = CompletionClient::new()?;
        let projects = JsonProjectStore::open(config.config().store.directory.clone()).await?;

        log::info!("使用 LLM 接口：{profile}（模型 {}）", settings.endpoint.model_name);

        Ok(Self {
            config,
            profile,
            settings,
            prompts,
            client,
            projects,
        })
    }

    fn orchestrator<'a>(&'a self, invocation: &'a Invocation) -> StageOrchestrator<'a> {
        StageOrchestrator::new(&self.client, &self.settings, &self.prompts)
            .with_progress(&PROGRESS)
            .with_stream(&invocation.stream)
            .with_cancellation(invocation.cancel.clone())
    }

    async fn load(&self, id: &str) -> Result<Project, CliError> {
        load_project(&self.projects, id).await
    }

    /// Runs one stage and persists the resulting snapshot. On failure the
    /// partial snapshot is persisted instead so the next run resumes.
    async fn run_stage(
        &self,
        invocation: &Invocation,
        project: &Project,
        request: StageRequest,
    ) -> Result<(Project, StageOutcome), CliError> {
        match self.orchestrator(invocation).run(project, request).await {
            Ok(output) => {
                let saved = self.projects.update(&output.project).await?;
                Ok((saved, output.outcome))
            }
            Err(failure) => {
                self.projects.update(&failure.partial).await?;
                if failure.error.is_cancelled() {
                    log::warn!("已取消，已完成的部分已保存。");
                } else {
                    log::warn!("已完成的部分已保存，可重新执行以继续。");
                }
                Err(failure.into())
            }
        }
    }

    fn remember_profile(mut self) -> Result<(), CliError> {
        self.config.touch_llm_profile(self.profile.clone());
        self.config.save()?;
        Ok(())
    }
}

async fn open_projects(config_path: &Path) -> Result<JsonProjectStore, CliError> {
    let config = ConfigStore::open(config_path.to_path_buf())?;
    Ok(JsonProjectStore::open(config.config().store.directory.clone()).await?)
}

async fn load_project(store: &JsonProjectStore, id: &str) -> Result<Project, CliError> {
    store
        .get(id)
        .await?
        .ok_or_else(|| CliError::ProjectNotFound(id.to_string()))
}

async fn handle_project(invocation: &Invocation, command: ProjectCommand) -> Result<(), CliError> {
    let store = open_projects(&invocation.config_path).await?;

    match command {
        ProjectCommand::Create(args) => {
            if args.chapters == 0 {
                return Err(CliError::InvalidNumber { field: "chapters" });
            }
            if args.words == 0 {
                return Err(CliError::InvalidNumber { field: "words" });
            }
            let project = store
                .create(NewProject {
                    title: args.title,
                    topic: args.topic,
                    genre: args.genre,
                    number_of_chapters: args.chapters,
                    word_number: args.words,
                    user_guidance: args.guidance.unwrap_or_default(),
                })
                .await?;
            log::info!("已创建项目《{}》", project.title);
            println!("{}", project.id);
        }
        ProjectCommand::List => {
            let projects = store.list().await?;
            if projects.is_empty() {
                println!("暂无项目。");
            }
            for project in projects {
                println!(
                    "{}  《{}》  {}/{} 章  更新于 {}",
                    project.id,
                    project.title,
                    project.chapters.len(),
                    project.number_of_chapters,
                    project.updated_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        ProjectCommand::Show(args) => {
            let project = load_project(&store, &args.id).await?;
            print_project(&project);
        }
        ProjectCommand::Delete(args) => {
            if store.delete(&args.id).await? {
                log::info!("已删除项目 {}", args.id);
            } else {
                return Err(CliError::ProjectNotFound(args.id));
            }
        }
    }

    Ok(())
}

fn print_project(project: &Project) {
    let flag = |done: bool| if done { "已完成" } else { "未完成" };
    println!("《{}》 ({})", project.title, project.id);
    println!("类型：{}", project.genre_label());
    println!("主题：{}", project.topic);
    println!(
        "规模：{} 章，每章约 {} 字",
        project.number_of_chapters, project.word_number
    );
    if !project.user_guidance.trim().is_empty() {
        println!("指导：{}", project.user_guidance);
    }
    println!("架构：{}", flag(project.architecture_generated));
    println!(
        "大纲：{}（已解析 {} 章）",
        flag(project.blueprint_generated),
        project.blueprint().len()
    );
    let written: Vec<String> = project.chapters.keys().map(u32::to_string).collect();
    if written.is_empty() {
        println!("正文：暂无");
    } else {
        println!("正文：第 {} 章", written.join("、"));
    }
}

async fn handle_architecture(
    invocation: &Invocation,
    command: ArchitectureCommand,
) -> Result<(), CliError> {
    match command {
        ArchitectureCommand::Generate(args) => run_generate_architecture(invocation, args).await,
    }
}

async fn run_generate_architecture(
    invocation: &Invocation,
    args: StageArgs,
) -> Result<(), CliError> {
    let session = Session::open(&invocation.config_path, args.llm_interface).await?;
    let project = session.load(&args.project).await?;

    log::info!(
        "开始生成《{}》的小说架构（类型：{}，章节数：{}）",
        project.title,
        project.genre_label(),
        project.number_of_chapters
    );

    let (saved, outcome) = session
        .run_stage(invocation, &project, StageRequest::Architecture)
        .await?;
    if let StageOutcome::Architecture(outcome) = outcome {
        log::info!(
            "新生成 {} 项，跳过已有 {} 项",
            outcome.generated.len(),
            outcome.skipped.len()
        );
    }
    if saved.architecture_generated {
        log::info!("核心种子、角色、世界观与情节架构均已生成完成。");
    }

    session.remember_profile()
}

async fn handle_blueprint(invocation: &Invocation, command: BlueprintCommand) -> Result<(), CliError> {
    match command {
        BlueprintCommand::Generate(args) => run_generate_blueprint(invocation, args).await,
    }
}

async fn run_generate_blueprint(invocation: &Invocation, args: StageArgs) -> Result<(), CliError> {
    let session = Session::open(&invocation.config_path, args.llm_interface).await?;
    let project = session.load(&args.project).await?;

    log::info!("开始生成章节大纲，共 {} 章。", project.number_of_chapters);

    let (saved, outcome) = session
        .run_stage(invocation, &project, StageRequest::Blueprint)
        .await?;
    if let StageOutcome::Blueprint(outcome) = outcome {
        if outcome.ranges.is_empty() {
            log::info!("章节大纲已完整，无需生成。");
        } else {
            log::info!(
                "本次生成 {} 段（分块大小 {}）",
                outcome.ranges.len(),
                outcome.chunk_size
            );
        }
    }
    log::info!("章节大纲现有 {} 章", saved.blueprint().len());

    session.remember_profile()
}

async fn handle_chapter(invocation: &Invocation, command: ChapterCommand) -> Result<(), CliError> {
    match command {
        ChapterCommand::Draft(args) => run_draft_chapter(invocation, args).await,
        ChapterCommand::Check(args) => run_check_chapter(invocation, args).await,
        ChapterCommand::Finalize(args) => run_finalize_chapter(invocation, args).await,
        ChapterCommand::Enrich(args) => run_enrich_chapter(invocation, args).await,
    }
}

async fn run_draft_chapter(invocation: &Invocation, args: ChapterDraftArgs) -> Result<(), CliError> {
    let chapter_number = ensure_chapter_number(args.chapter)?;
    let session = Session::open(&invocation.config_path, args.llm_interface).await?;
    let mut project = session.load(&args.project).await?;

    log::info!("开始生成第{chapter_number}章草稿。");

    let orchestrator = session.orchestrator(invocation);
    let draft = orchestrator
        .chapters()
        .generate_draft(&project, chapter_number)
        .await?;
    let mut text = draft.content;

    if args.check {
        let context = QualityContext::from_project(&project, chapter_number)?;
        let quality = orchestrator.quality();
        for round in 0..=args.max_repairs {
            let report = quality.check_quality(&text, &context).await;
            print_report(&report);
            if report.overall_pass || round == args.max_repairs {
                break;
            }
            log::info!("质检未通过，开始第 {} 次修复。", round + 1);
            text = quality.fix_chapter(&text, &report, &context).await;
        }
    }

    if args.commit {
        project.commit_chapter(chapter_number, text);
        session.projects.update(&project).await?;
        log::info!("第{chapter_number}章已保存到项目。");
    } else if !invocation.stream.echo || args.check {
        println!("{text}");
    }

    session.remember_profile()
}

async fn run_check_chapter(invocation: &Invocation, args: ChapterArgs) -> Result<(), CliError> {
    let chapter_number = ensure_chapter_number(args.chapter)?;
    let session = Session::open(&invocation.config_path, args.llm_interface).await?;
    let project = session.load(&args.project).await?;
    let text = stored_chapter(&project, chapter_number)?;

    let context = QualityContext::from_project(&project, chapter_number)?;
    let report = session
        .orchestrator(invocation)
        .quality()
        .check_quality(&text, &context)
        .await;
    print_report(&report);

    session.remember_profile()
}

async fn run_finalize_chapter(
    invocation: &Invocation,
    args: FinalizeArgs,
) -> Result<(), CliError> {
    let chapter_number = ensure_chapter_number(args.chapter)?;
    let session = Session::open(&invocation.config_path, args.llm_interface).await?;
    let mut project = session.load(&args.project).await?;

    let text = match args.file {
        Some(path) => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| CliError::Io { path, source })?;
            project.commit_chapter(chapter_number, text.clone());
            text
        }
        None => stored_chapter(&project, chapter_number)?,
    };

    log::info!("开始定稿第{chapter_number}章，更新前文摘要与角色状态。");

    let (_, outcome) = session
        .run_stage(
            invocation,
            &project,
            StageRequest::Finalize {
                chapter_number,
                chapter_text: text,
            },
        )
        .await?;
    if let StageOutcome::Finalize(outcome) = outcome {
        if !outcome.summary_updated {
            log::warn!("前文摘要未能更新，保留原有内容。");
        }
        if !outcome.character_state_updated {
            log::warn!("角色状态未能更新，保留原有内容。");
        }
    }

    session.remember_profile()
}

async fn run_enrich_chapter(invocation: &Invocation, args: EnrichArgs) -> Result<(), CliError> {
    let chapter_number = ensure_chapter_number(args.chapter)?;
    let session = Session::open(&invocation.config_path, args.llm_interface).await?;
    let mut project = session.load(&args.project).await?;
    let text = stored_chapter(&project, chapter_number)?;

    let enriched = session
        .orchestrator(invocation)
        .chapters()
        .enrich_chapter(&text, project.word_number)
        .await?;

    if args.commit {
        project.commit_chapter(chapter_number, enriched);
        session.projects.update(&project).await?;
        log::info!("扩写后的第{chapter_number}章已保存。");
    } else if !invocation.stream.echo {
        println!("{enriched}");
    }

    session.remember_profile()
}

async fn run_export(invocation: &Invocation, args: ExportArgs) -> Result<(), CliError> {
    let store = open_projects(&invocation.config_path).await?;
    let project = load_project(&store, &args.project).await?;
    let text = project.export_text();

    match args.output {
        Some(path) => {
            tokio::fs::write(&path, text)
                .await
                .map_err(|source| CliError::Io {
                    path: path.clone(),
                    source,
                })?;
            log::info!("已导出到 {}", path.display());
        }
        None => println!("{text}"),
    }

    Ok(())
}

async fn run_list_models(invocation: &Invocation, args: ModelsArgs) -> Result<(), CliError> {
    let mut store = ConfigStore::open(invocation.config_path.clone())?;
    store.ensure_recent_defaults();
    let profile = select_llm_interface(&store, args.llm_interface)?;
    let settings = store.config().generation_settings(Some(&profile))?;

    let client = CompletionClient::new()?;
    let models = tokio::select! {
        _ = invocation.cancel.cancelled() => return Err(CliError::Cancelled),
        result = client.list_models(&settings.endpoint) => result?,
    };

    if models.is_empty() {
        println!("接口 `{profile}` 未返回任何模型。");
    }
    for model in models {
        println!("{model}");
    }

    Ok(())
}

fn print_report(report: &QualityReport) {
    let verdict = |pass: bool| if pass { "通过" } else { "未通过" };
    println!("—— 质检结果 ——");
    println!("字数：{}（{}）", report.word_count, verdict(report.word_count_pass));
    println!("内容符合大纲：{}", verdict(report.content_match));
    println!("未提前写入下一章：{}", verdict(!report.next_chapter_leak));
    println!("章末悬念：{}", verdict(report.has_cliffhanger));
    println!("总体：{}", verdict(report.overall_pass));
    for issue in &report.issues {
        println!("  - {issue}");
    }
}

fn stored_chapter(project: &Project, chapter_number: u32) -> Result<String, CliError> {
    project
        .chapter(chapter_number)
        .filter(|text| !text.trim().is_empty())
        .map(str::to_string)
        .ok_or(CliError::ChapterNotWritten(chapter_number))
}

fn ensure_chapter_number(number: u32) -> Result<u32, CliError> {
    if number == 0 {
        Err(CliError::InvalidChapterNumber(number))
    } else {
        Ok(number)
    }
}

fn select_llm_interface(store: &ConfigStore, preferred: Option<String>) -> Result<String, CliError> {
    if let Some(name) = normalize_preference(preferred) {
        if store.config().get_llm_profile(&name).is_some() {
            return Ok(name);
        }
        return Err(CliError::UnknownInterface(name));
    }

    if let Some(name) = store.last_llm_profile() {
        return Ok(name.to_string());
    }

    if let Some(name) = store.config().llm_profiles.keys().next() {
        return Ok(name.clone());
    }

    Err(CliError::MissingLlmProfile)
}

fn normalize_preference(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[derive(Debug, Error)]
enum CliError {
    #[error("配置文件错误: {0}")]
    Config(#[from] ConfigError),
    #[error("缺少可用的 LLM 配置，请先在配置文件中添加 llm_profiles。")]
    MissingLlmProfile,
    #[error("未找到名为 `{0}` 的接口配置")]
    UnknownInterface(String),
    #[error("项目 `{0}` 不存在")]
    ProjectNotFound(String),
    #[error("参数 `{field}` 必须大于 0。")]
    InvalidNumber { field: &'static str },
    #[error("章节编号必须从 1 开始，收到 {0}")]
    InvalidChapterNumber(u32),
    #[error("第{0}章尚无正文，请先生成并保存草稿")]
    ChapterNotWritten(u32),
    #[error("读取或写入文件 `{path}` 失败: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("项目存储错误: {0}")]
    Store(#[from] StoreError),
    #[error("适配器调用失败: {0}")]
    Adapter(#[from] AdapterError),
    #[error("提示词加载失败: {0}")]
    Prompt(#[from] PromptError),
    #[error("章节处理失败: {0}")]
    Chapter(#[from] ChapterError),
    #[error("阶段执行失败: {0}")]
    Stage(#[from] StageFailure),
    #[error("操作已取消")]
    Cancelled,
}

#[derive(Parser)]
#[command(name = "storyloom", version, about = "长篇小说分阶段生成命令行工具")]
struct Cli {
    /// 指定配置文件路径
    #[arg(long, global = true, default_value = "config.json", env = "STORYLOOM_CONFIG")]
    config: PathBuf,

    /// 实时输出模型生成的内容
    #[arg(long, global = true)]
    echo: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 项目管理
    #[command(subcommand)]
    Project(ProjectCommand),
    /// 小说架构相关操作
    #[command(subcommand)]
    Architecture(ArchitectureCommand),
    /// 章节大纲相关操作
    #[command(subcommand)]
    Blueprint(BlueprintCommand),
    /// 章节相关操作
    #[command(subcommand)]
    Chapter(ChapterCommand),
    /// 导出项目全部正文为纯文本
    Export(ExportArgs),
    /// 列出接口可用的模型
    Models(ModelsArgs),
}

#[derive(Subcommand)]
enum ProjectCommand {
    /// 新建项目并输出其 ID
    Create(ProjectCreateArgs),
    /// 列出全部项目，最近更新的在前
    List,
    /// 查看项目概况
    Show(ProjectIdArgs),
    /// 删除项目
    Delete(ProjectIdArgs),
}

#[derive(Subcommand)]
enum ArchitectureCommand {
    /// 生成或继续补全小说架构
    Generate(StageArgs),
}

#[derive(Subcommand)]
enum BlueprintCommand {
    /// 生成或续跑章节大纲
    Generate(StageArgs),
}

#[derive(Subcommand)]
enum ChapterCommand {
    /// 生成章节草稿，可选质检修复并保存
    Draft(ChapterDraftArgs),
    /// 对已保存的章节进行质检
    Check(ChapterArgs),
    /// 定稿指定章节，更新前文摘要与角色状态
    Finalize(FinalizeArgs),
    /// 扩写字数不足的章节
    Enrich(EnrichArgs),
}

#[derive(Args)]
struct ProjectCreateArgs {
    /// 书名
    #[arg(long, value_name = "TEXT")]
    title: String,
    /// 主题或核心创意
    #[arg(long, value_name = "TEXT")]
    topic: String,
    /// 类型标签，可用逗号分隔多个
    #[arg(long, value_name = "TAGS", value_delimiter = ',')]
    genre: Vec<String>,
    /// 章节总数
    #[arg(long, value_name = "N")]
    chapters: u32,
    /// 每章目标字数
    #[arg(long, value_name = "N", default_value_t = 3000)]
    words: u32,
    /// 贯穿全书的创作指导
    #[arg(long, value_name = "TEXT")]
    guidance: Option<String>,
}

#[derive(Args)]
struct ProjectIdArgs {
    /// 项目 ID
    #[arg(long)]
    id: String,
}

#[derive(Args)]
struct StageArgs {
    /// 项目 ID
    #[arg(long, value_name = "ID")]
    project: String,
    /// 指定使用的 LLM 接口名称，默认为最近使用的接口
    #[arg(long)]
    llm_interface: Option<String>,
}

#[derive(Args)]
struct ChapterArgs {
    /// 项目 ID
    #[arg(long, value_name = "ID")]
    project: String,
    /// 章节编号
    #[arg(long, value_name = "N")]
    chapter: u32,
    /// 指定使用的 LLM 接口名称
    #[arg(long)]
    llm_interface: Option<String>,
}

#[derive(Args)]
struct ChapterDraftArgs {
    /// 项目 ID
    #[arg(long, value_name = "ID")]
    project: String,
    /// 需要生成的章节编号
    #[arg(long, value_name = "N")]
    chapter: u32,
    /// 指定使用的 LLM 接口名称
    #[arg(long)]
    llm_interface: Option<String>,
    /// 生成后进行质检，未通过时自动修复
    #[arg(long)]
    check: bool,
    /// 质检不通过时最多修复的次数
    #[arg(long, value_name = "N", default_value_t = 1)]
    max_repairs: u32,
    /// 将最终文本保存为该章正文
    #[arg(long)]
    commit: bool,
}

#[derive(Args)]
struct FinalizeArgs {
    /// 项目 ID
    #[arg(long, value_name = "ID")]
    project: String,
    /// 需要定稿的章节编号
    #[arg(long, value_name = "N")]
    chapter: u32,
    /// 使用该文件的内容作为本章正文，默认使用已保存的正文
    #[arg(long, value_name = "FILE")]
    file: Option<PathBuf>,
    /// 指定使用的 LLM 接口名称
    #[arg(long)]
    llm_interface: Option<String>,
}

#[derive(Args)]
struct EnrichArgs {
    /// 项目 ID
    #[arg(long, value_name = "ID")]
    project: String,
    /// 需要扩写的章节编号
    #[arg(long, value_name = "N")]
    chapter: u32,
    /// 指定使用的 LLM 接口名称
    #[arg(long)]
    llm_interface: Option<String>,
    /// 用扩写结果替换已保存的正文
    #[arg(long)]
    commit: bool,
}

#[derive(Args)]
struct ExportArgs {
    /// 项目 ID
    #[arg(long, value_name = "ID")]
    project: String,
    /// 输出文件，默认打印到标准输出
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct ModelsArgs {
    /// 指定要查询的接口名称，默认为最近使用的接口
    #[arg(long)]
    llm_interface: Option<String>,
}
