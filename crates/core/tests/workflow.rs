use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use storyloom_core::{
    ArchitectureField, ChapterError, ChunkCallback, EndpointConfig, GenerationSettings,
    LanguageModel, LanguageModelError, MemoryProjectStore, NewProject, Pacing, Project,
    ProjectStore, PromptRegistry, QualityReport, Stage, StageError, StageOrchestrator,
    StageOutcome, StageRequest, VecProgressSink,
};

struct StubModel {
    responses: Mutex<VecDeque<Result<String, LanguageModelError>>>,
    prompts: Mutex<Vec<String>>,
}

impl StubModel {
    fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|text| Ok(text.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn then_fail(self, status: u16) -> Self {
        self.responses
            .lock()
            .expect("stub mutex poisoned")
            .push_back(Err(LanguageModelError::RequestFailed {
                status,
                body: "stub failure".into(),
            }));
        self
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("stub mutex poisoned").clone()
    }

    fn assert_drained(&self) {
        let guard = self.responses.lock().expect("stub mutex poisoned");
        assert!(guard.is_empty(), "expected all stub responses to be consumed");
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete(
        &self,
        _endpoint: &EndpointConfig,
        prompt: &str,
        _on_chunk: Option<ChunkCallback<'_>>,
        _cancel: &CancellationToken,
    ) -> Result<String, LanguageModelError> {
        self.prompts
            .lock()
            .expect("stub mutex poisoned")
            .push(prompt.to_string());
        self.responses
            .lock()
            .expect("stub mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(LanguageModelError::MalformedResponse(
                    "stub model has no remaining responses".into(),
                ))
            })
    }
}

fn settings() -> GenerationSettings {
    GenerationSettings::new(EndpointConfig {
        api_key: "sk-stub".into(),
        base_url: "http://localhost:9/v1".into(),
        model_name: "stub-model".into(),
        ..EndpointConfig::default()
    })
}

fn new_project(chapters: u32) -> NewProject {
    NewProject {
        title: "雾港纪事".into(),
        topic: "港口城市里消失的灯塔看守人".into(),
        genre: vec!["悬疑".into()],
        number_of_chapters: chapters,
        word_number: 1000,
        user_guidance: String::new(),
    }
}

fn outline(range: std::ops::RangeInclusive<u32>) -> String {
    range
        .map(|n| {
            format!(
                "第{n}章 - 雾中{n}\n本章定位：推进{n}\n核心作用：线索{n}\n悬念密度：紧凑\n伏笔操作：埋设{n}\n认知颠覆：★★☆☆☆\n本章简述：看守人留下的第{n}条记录\n"
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::test]
async fn architecture_prompts_accumulate_previous_fields() {
    let outputs = [
        "SEED-种子文本",
        "DYNAMICS-角色动力",
        "STATE-角色状态",
        "WORLD-世界设定",
        "PLOT-三幕情节",
    ];
    let model = StubModel::new(outputs);
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let progress = VecProgressSink::new();
    let orchestrator = StageOrchestrator::new(&model, &settings, &prompts).with_progress(&progress);

    let project = Project::from_new(new_project(3));
    let output = orchestrator
        .run(&project, StageRequest::Architecture)
        .await
        .unwrap();

    let updated = output.project;
    assert_eq!(updated.core_seed, outputs[0]);
    assert_eq!(updated.character_dynamics, outputs[1]);
    assert_eq!(updated.character_state, outputs[2]);
    assert_eq!(updated.world_building, outputs[3]);
    assert_eq!(updated.plot_architecture, outputs[4]);
    assert!(updated.architecture_generated);
    assert!(project.core_seed.is_empty());

    let sent = model.prompts();
    assert_eq!(sent.len(), 5);
    for (k, prompt) in sent.iter().enumerate() {
        for earlier in &outputs[..k] {
            assert!(prompt.contains(earlier), "prompt {} lacks {earlier}", k + 1);
        }
    }
    assert_eq!(
        progress.milestones(),
        vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5), (5, 5)]
    );
    model.assert_drained();
}

#[tokio::test]
async fn architecture_resumes_from_populated_fields() {
    let model = StubModel::new(["WORLD-世界设定", "PLOT-三幕情节"]);
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let orchestrator = StageOrchestrator::new(&model, &settings, &prompts);

    let mut project = Project::from_new(new_project(3));
    project.core_seed = "已有种子".into();
    project.character_dynamics = "已有角色".into();
    project.character_state = "已有状态".into();

    let output = orchestrator
        .run(&project, StageRequest::Architecture)
        .await
        .unwrap();

    let StageOutcome::Architecture(outcome) = output.outcome else {
        panic!("unexpected outcome");
    };
    assert_eq!(
        outcome.generated,
        vec![ArchitectureField::WorldBuilding, ArchitectureField::PlotArchitecture]
    );
    assert_eq!(output.project.core_seed, "已有种子");
    assert_eq!(model.prompts().len(), 2);
}

#[tokio::test]
async fn draft_for_chapter_outside_blueprint_is_not_found() {
    let model = StubModel::new(Vec::<String>::new());
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let orchestrator = StageOrchestrator::new(&model, &settings, &prompts);

    let mut project = Project::from_new(new_project(3));
    project.chapter_blueprint = outline(1..=2);

    let failure = orchestrator
        .run(&project, StageRequest::Draft { chapter_number: 3 })
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Draft);
    assert!(matches!(
        failure.error,
        StageError::Chapter(ChapterError::ChapterNotFound { number: 3 })
    ));
    assert!(model.prompts().is_empty());
}

#[tokio::test]
async fn blueprint_resumes_after_existing_chapters() {
    let model = StubModel::new([outline(17..=32), outline(33..=40)]);
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let orchestrator =
        StageOrchestrator::new(&model, &settings, &prompts).with_pacing(Pacing::none());

    let mut project = Project::from_new(new_project(40));
    project.chapter_blueprint = outline(1..=16);

    let output = orchestrator
        .run(&project, StageRequest::Blueprint)
        .await
        .unwrap();

    let blueprint = output.project.blueprint();
    assert_eq!(blueprint.len(), 40);
    assert!(output.project.blueprint_generated);

    let sent = model.prompts();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].contains("第16章 - 雾中16"));
    model.assert_drained();
}

#[tokio::test]
async fn failed_blueprint_chunk_keeps_completed_chunks() {
    let model = StubModel::new([outline(1..=16)]).then_fail(401);
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let orchestrator =
        StageOrchestrator::new(&model, &settings, &prompts).with_pacing(Pacing::none());

    let project = Project::from_new(new_project(40));
    let failure = orchestrator
        .run(&project, StageRequest::Blueprint)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Blueprint);
    assert!(!failure.error.is_cancelled());
    assert_eq!(failure.partial.blueprint().len(), 16);
    assert!(!failure.partial.blueprint_generated);
    assert!(project.chapter_blueprint.is_empty());

    let retry_model = StubModel::new([outline(17..=32), outline(33..=40)]);
    let retry = StageOrchestrator::new(&retry_model, &settings, &prompts)
        .with_pacing(Pacing::none())
        .run(&failure.partial, StageRequest::Blueprint)
        .await
        .unwrap();
    assert_eq!(retry.project.blueprint().len(), 40);
    retry_model.assert_drained();
}

#[tokio::test]
async fn quality_check_passes_when_model_is_unreachable() {
    let model = StubModel::new(Vec::<String>::new()).then_fail(503);
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let orchestrator = StageOrchestrator::new(&model, &settings, &prompts);

    let mut project = Project::from_new(new_project(3));
    project.chapter_blueprint = outline(1..=3);

    let output = orchestrator
        .run(
            &project,
            StageRequest::QualityCheck {
                chapter_number: 1,
                chapter_text: "雾气从海面上升起。".into(),
            },
        )
        .await
        .unwrap();

    let StageOutcome::QualityCheck(report) = output.outcome else {
        panic!("unexpected outcome");
    };
    assert!(report.is_fully_passing());
    assert_eq!(report.issues.len(), 1);
}

fn drafted_project() -> Project {
    let mut project = Project::from_new(new_project(3));
    project.chapter_blueprint = outline(1..=3);
    project.commit_chapter(1, "雾气从海面上升起。");
    project
}

#[tokio::test]
async fn repair_returns_revision_without_committing_it() {
    let model = StubModel::new(["灯塔的灯在午夜熄灭，看守人的脚印停在礁石边。"]);
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let orchestrator = StageOrchestrator::new(&model, &settings, &prompts);

    let project = drafted_project();
    let report = QualityReport {
        has_cliffhanger: false,
        overall_pass: false,
        issues: vec!["结尾缺少悬念".into()],
        ..QualityReport::default()
    };
    let output = orchestrator
        .run(
            &project,
            StageRequest::Repair {
                chapter_number: 1,
                chapter_text: "雾气从海面上升起。".into(),
                report,
            },
        )
        .await
        .unwrap();

    let StageOutcome::Repair { text } = output.outcome else {
        panic!("unexpected outcome");
    };
    assert_eq!(text, "灯塔的灯在午夜熄灭，看守人的脚印停在礁石边。");
    assert_eq!(output.project.chapter(1), project.chapter(1));

    let sent = model.prompts();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("结尾缺少悬念"));
    model.assert_drained();
}

#[tokio::test]
async fn repair_of_passing_report_sends_nothing() {
    let model = StubModel::new(Vec::<String>::new());
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let orchestrator = StageOrchestrator::new(&model, &settings, &prompts);

    let output = orchestrator
        .run(
            &drafted_project(),
            StageRequest::Repair {
                chapter_number: 1,
                chapter_text: "雾气从海面上升起。".into(),
                report: QualityReport::default(),
            },
        )
        .await
        .unwrap();

    let StageOutcome::Repair { text } = output.outcome else {
        panic!("unexpected outcome");
    };
    assert_eq!(text, "雾气从海面上升起。");
    assert!(model.prompts().is_empty());
}

#[tokio::test]
async fn repair_outside_blueprint_fails_with_snapshot() {
    let model = StubModel::new(Vec::<String>::new());
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let orchestrator = StageOrchestrator::new(&model, &settings, &prompts);

    let project = drafted_project();
    let failure = orchestrator
        .run(
            &project,
            StageRequest::Repair {
                chapter_number: 9,
                chapter_text: "雾气从海面上升起。".into(),
                report: QualityReport {
                    overall_pass: false,
                    ..QualityReport::default()
                },
            },
        )
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Repair);
    assert!(matches!(
        failure.error,
        StageError::Chapter(ChapterError::ChapterNotFound { number: 9 })
    ));
    assert_eq!(*failure.partial, project);
    assert!(model.prompts().is_empty());
}

#[tokio::test]
async fn enrich_returns_expanded_text() {
    let model = StubModel::new(["`雾气从海面上升起，吞没了码头上最后一盏灯。`"]);
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let orchestrator = StageOrchestrator::new(&model, &settings, &prompts);

    let project = drafted_project();
    let output = orchestrator
        .run(
            &project,
            StageRequest::Enrich {
                chapter_text: "雾气从海面上升起。".into(),
            },
        )
        .await
        .unwrap();

    let StageOutcome::Enrich { text } = output.outcome else {
        panic!("unexpected outcome");
    };
    assert_eq!(text, "雾气从海面上升起，吞没了码头上最后一盏灯。");
    assert_eq!(output.project.chapter(1), project.chapter(1));

    let sent = model.prompts();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("雾气从海面上升起。"));
    assert!(sent[0].contains("1000"));
}

#[tokio::test]
async fn failed_enrich_keeps_project_snapshot() {
    let model = StubModel::new(Vec::<String>::new()).then_fail(401);
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let orchestrator = StageOrchestrator::new(&model, &settings, &prompts);

    let project = drafted_project();
    let failure = orchestrator
        .run(
            &project,
            StageRequest::Enrich {
                chapter_text: "雾气从海面上升起。".into(),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Enrich);
    assert!(!failure.error.is_cancelled());
    assert!(matches!(
        failure.error,
        StageError::Chapter(ChapterError::Model { .. })
    ));
    assert_eq!(*failure.partial, project);
    model.assert_drained();
}

#[tokio::test]
async fn project_flows_through_every_stage() {
    let store = MemoryProjectStore::new();
    let project = store.create(new_project(2)).await.unwrap();

    let model = StubModel::new([
        "种子".to_string(),
        "角色".to_string(),
        "状态".to_string(),
        "世界".to_string(),
        "情节".to_string(),
        outline(1..=2),
        "灯塔的灯在午夜熄灭了。".to_string(),
        "第一章摘要：灯塔熄灭。".to_string(),
        "看守人：失踪".to_string(),
    ]);
    let settings = settings();
    let prompts = PromptRegistry::new().unwrap();
    let orchestrator =
        StageOrchestrator::new(&model, &settings, &prompts).with_pacing(Pacing::none());

    let output = orchestrator
        .run(&project, StageRequest::Architecture)
        .await
        .unwrap();
    let project = store.update(&output.project).await.unwrap();

    let output = orchestrator
        .run(&project, StageRequest::Blueprint)
        .await
        .unwrap();
    let project = store.update(&output.project).await.unwrap();
    assert!(project.blueprint_generated);

    let output = orchestrator
        .run(&project, StageRequest::Draft { chapter_number: 1 })
        .await
        .unwrap();
    let StageOutcome::Draft(draft) = output.outcome else {
        panic!("unexpected outcome");
    };
    assert!(output.project.chapter(1).is_none());

    let mut project = output.project;
    project.commit_chapter(1, draft.content.clone());
    let output = orchestrator
        .run(
            &project,
            StageRequest::Finalize {
                chapter_number: 1,
                chapter_text: draft.content,
            },
        )
        .await
        .unwrap();
    let project = store.update(&output.project).await.unwrap();

    assert_eq!(project.global_summary, "第一章摘要：灯塔熄灭。");
    assert_eq!(project.character_state, "看守人：失踪");

    let stored = store.get(&project.id).await.unwrap().unwrap();
    let exported = stored.export_text();
    assert!(exported.starts_with("《雾港纪事》"));
    assert!(exported.contains("第1章 雾中1"));
    assert!(exported.contains("灯塔的灯在午夜熄灭了。"));
    model.assert_drained();
}
