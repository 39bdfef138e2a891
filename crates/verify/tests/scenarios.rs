use std::sync::Arc;
use std::time::Duration;

use canopy_engine::{CoordinatorOptions, KindClass, TreeCoordinator, TreePath, ViewContext, ViewFilter};
use canopy_verify::{ProtocolVerifier, RecordingSurface, SurfaceOp, TestElement, TestModel, test_path};
use pretty_assertions::assert_eq;

const SETTLE: Duration = Duration::from_secs(60);

fn start(model: &TestModel) -> (TreeCoordinator<TestElement>, RecordingSurface, ProtocolVerifier<TestElement>) {
	let surface = RecordingSurface::new();
	let coordinator = TreeCoordinator::spawn(
		Arc::new(model.clone()),
		Box::new(surface.clone()),
		ViewContext::new("scenarios"),
		CoordinatorOptions::default(),
	);
	let verifier = ProtocolVerifier::new();
	coordinator.add_observer(Arc::new(verifier.clone()));
	(coordinator, surface, verifier)
}

#[tokio::test]
async fn initial_population_presents_counts_children_and_labels() {
	let model = TestModel::new("root");
	for name in ["a", "b", "c"] {
		model.add(&[], name);
	}
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();

	assert_eq!(surface.child_names(&[]), vec!["a", "b", "c"]);
	assert_eq!(surface.child_count_of(&[]), Some(3));
	assert_eq!(surface.label_text(&["a"], None).as_deref(), Some("a"));
	assert_eq!(surface.is_expandable(&["b"]), Some(false));
	assert_eq!(model.query_count(&[], KindClass::Children), 1);

	let (begun, completed) = verifier.sequences();
	assert_eq!(begun, completed);
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn duplicate_expands_coalesce_into_one_count_query() {
	let model = TestModel::new("root");
	model.add(&[], "a");
	model.add(&["a"], "a1");
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();

	verifier.expect_sequences(1);
	coordinator.expand(test_path(&["a"]));
	coordinator.expand(test_path(&["a"]));
	verifier.wait_settled(SETTLE).await.unwrap();

	assert!(surface.is_expanded(&["a"]));
	assert_eq!(surface.child_names(&["a"]), vec!["a1"]);
	assert_eq!(model.query_count(&["a"], KindClass::ChildCount), 1);
	assert_eq!(verifier.started_count(&test_path(&["a"]), KindClass::ChildCount), 1);
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn removed_then_readded_sibling_settles_on_the_fresh_instance() {
	let model = TestModel::new("root");
	for name in ["a", "b", "c"] {
		model.add(&[], name);
	}
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();
	let old_serial = surface.children_of(&[])[1].serial();

	verifier.expect_model_changes(2);
	verifier.expect_sequences(1);
	coordinator.apply_delta(model.remove(&["b"]));
	coordinator.apply_delta(model.add(&[], "b"));
	let fresh_serial = model.element(&["b"]).unwrap().serial();
	verifier.wait_settled(SETTLE).await.unwrap();

	// The model now lists the re-added node last.
	assert_eq!(surface.child_names(&[]), vec!["a", "c", "b"]);
	let presented = surface.children_of(&[])[2].serial();
	assert_eq!(presented, fresh_serial);
	assert_ne!(presented, old_serial);
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn clearing_the_input_cancels_outstanding_requests() {
	let model = TestModel::new("root");
	for name in ["a", "b"] {
		model.add(&[], name);
	}
	model.set_latency(Duration::from_millis(25));
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	coordinator.set_input(None);
	verifier.wait_settled(SETTLE).await.unwrap();
	assert!(verifier.canceled_count() >= 1);

	// Let the canceled query's late completion drain; it must not present
	// anything for the cleared input.
	tokio::time::sleep(Duration::from_millis(80)).await;
	assert!(surface.input().is_none());
	assert!(surface.children_of(&[]).is_empty());
	let ops = surface.ops();
	let last_input = ops.iter().rposition(|op| matches!(op, SurfaceOp::SetInput(_))).unwrap();
	assert!(
		ops[last_input..]
			.iter()
			.all(|op| !matches!(op, SurfaceOp::Add(_) | SurfaceOp::Insert(..))),
		"stale completion mutated the surface: {:?}",
		&ops[last_input..]
	);
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn expand_select_state_survives_an_input_round_trip() {
	let model = TestModel::new("root");
	model.add(&[], "a");
	model.add(&[], "b");
	model.add(&["a"], "a1");
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();

	verifier.expect_sequences(1);
	verifier.expect_model_changes(1);
	coordinator.expand(test_path(&["a"]));
	coordinator.apply_delta(model.select(&["a", "a1"]));
	verifier.wait_settled(SETTLE).await.unwrap();
	assert!(surface.is_expanded(&["a"]));
	assert_eq!(surface.selected(), vec!["/a/a1"]);

	// Swapping the input away captures the expand/select memento.
	verifier.expect_sequences(1);
	verifier.expect_state_saves(1);
	coordinator.set_input(Some(TestElement::named("interim")));
	verifier.wait_settled(SETTLE).await.unwrap();
	assert!(!surface.is_expanded(&["a"]));

	// Swapping back to an equal-but-distinct input instance replays it.
	verifier.expect_sequences(1);
	verifier.expect_state_restores(1);
	coordinator.set_input(Some(TestElement::named("root")));
	verifier.wait_settled(SETTLE).await.unwrap();

	assert!(surface.is_expanded(&["a"]));
	assert_eq!(surface.child_names(&["a"]), vec!["a1"]);
	assert_eq!(surface.selected(), vec!["/a/a1"]);

	// Each memento node replays at most once.
	let ops = surface.ops();
	let last_input = ops.iter().rposition(|op| matches!(op, SurfaceOp::SetInput(_))).unwrap();
	let replayed_expands = ops[last_input..].iter().filter(|op| **op == SurfaceOp::Expand("/a".to_string())).count();
	assert_eq!(replayed_expands, 1);
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn filters_hide_children_and_correct_counts() {
	let model = TestModel::new("root");
	for name in ["a", "b", "c"] {
		model.add(&[], name);
	}
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();

	verifier.expect_sequences(1);
	coordinator.set_filter(Some(ViewFilter::new(|_, element: &TestElement| element.name() != "b")));
	verifier.wait_settled(SETTLE).await.unwrap();
	assert_eq!(surface.child_names(&[]), vec!["a", "c"]);
	assert_eq!(surface.child_count_of(&[]), Some(2));

	verifier.expect_sequences(1);
	coordinator.set_filter(None);
	verifier.wait_settled(SETTLE).await.unwrap();
	assert_eq!(surface.child_names(&[]), vec!["a", "b", "c"]);
	assert_eq!(surface.child_count_of(&[]), Some(3));
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn proxies_install_feed_deltas_and_dispose() {
	let model = TestModel::new("root");
	model.add(&[], "a");
	model.enable_proxies();
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();

	verifier.expect_model_changes(1);
	coordinator.apply_delta(model.install(&["a"]));
	verifier.wait_settled(SETTLE).await.unwrap();
	assert_eq!(model.proxy_events(), vec!["installed /a"]);

	// The installed proxy feeds its own model changes back in.
	let sender = model.proxy_sender().unwrap();
	verifier.expect_model_changes(1);
	verifier.expect_sequences(1);
	sender.send(model.add(&["a"], "a2"));
	verifier.wait_settled(SETTLE).await.unwrap();
	assert_eq!(surface.child_names(&["a"]), vec!["a2"]);

	verifier.expect_model_changes(1);
	coordinator.apply_delta(model.uninstall(&["a"]));
	verifier.wait_settled(SETTLE).await.unwrap();
	assert_eq!(model.proxy_events(), vec!["installed /a", "disposed /a"]);
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn sibling_labels_batch_into_one_source_call() {
	let model = TestModel::new("root");
	for name in ["a", "b", "c"] {
		model.add(&[], name);
	}
	model.enable_batching(KindClass::Label);
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();

	assert_eq!(model.batch_call_count(), 1);
	for name in ["a", "b", "c"] {
		assert_eq!(surface.label_text(&[name], None).as_deref(), Some(name));
		assert_eq!(model.query_count(&[name], KindClass::Label), 1);
	}
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn expand_to_level_descends_without_bound() {
	let model = TestModel::new("root");
	model.add(&[], "a");
	model.add(&["a"], "a1");
	model.add(&["a", "a1"], "a2");
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();

	verifier.expect_sequences(1);
	coordinator.expand_to_level(test_path(&["a"]), -1);
	verifier.wait_settled(SETTLE).await.unwrap();

	assert!(surface.is_expanded(&["a"]));
	assert!(surface.is_expanded(&["a", "a1"]));
	assert_eq!(surface.child_names(&["a", "a1"]), vec!["a2"]);
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn added_with_an_index_lands_in_its_slot() {
	let model = TestModel::new("root");
	for name in ["a", "c"] {
		model.add(&[], name);
	}
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();

	verifier.expect_model_changes(1);
	verifier.expect_sequences(1);
	coordinator.apply_delta(model.add_at(&[], "b", 1));
	verifier.wait_settled(SETTLE).await.unwrap();

	assert_eq!(surface.child_names(&[]), vec!["a", "b", "c"]);
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn repeated_content_deltas_issue_one_count_query() {
	let model = TestModel::new("root");
	for name in ["a", "b"] {
		model.add(&[], name);
	}
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();
	let baseline = model.query_count(&[], KindClass::ChildCount);

	// Keep the first count query in flight while the duplicate arrives.
	model.set_latency(Duration::from_millis(10));
	verifier.expect_model_changes(2);
	verifier.expect_sequences(1);
	coordinator.apply_delta(model.refresh(&[]));
	coordinator.apply_delta(model.refresh(&[]));
	verifier.wait_settled(SETTLE).await.unwrap();

	assert_eq!(model.query_count(&[], KindClass::ChildCount), baseline + 1);
	assert_eq!(surface.child_names(&[]), vec!["a", "b"]);
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn a_stale_input_encoding_does_not_consume_another_inputs_memento() {
	let model = TestModel::new("root");
	model.add(&[], "a");
	model.add(&["a"], "a1");
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();
	verifier.expect_sequences(1);
	coordinator.expand(test_path(&["a"]));
	verifier.wait_settled(SETTLE).await.unwrap();

	// Swapping away captures root's memento.
	verifier.expect_sequences(1);
	verifier.expect_state_saves(1);
	coordinator.set_input(Some(TestElement::named("interim")));
	verifier.wait_settled(SETTLE).await.unwrap();

	// A slow encode from the first swap resolves while the second swap's
	// input is current; it must not replay root's memento there.
	model.set_latency(Duration::from_millis(30));
	verifier.expect_sequences(1);
	coordinator.set_input(Some(TestElement::named("root")));
	coordinator.set_input(Some(TestElement::named("other")));
	verifier.wait_settled(SETTLE).await.unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;

	let ops = surface.ops();
	let last_input = ops.iter().rposition(|op| matches!(op, SurfaceOp::SetInput(_))).unwrap();
	assert!(
		!ops[last_input..].contains(&SurfaceOp::Expand("/a".to_string())),
		"a foreign input received root's replay: {:?}",
		&ops[last_input..]
	);

	// The memento survived for its real owner.
	verifier.expect_sequences(1);
	verifier.expect_state_restores(1);
	coordinator.set_input(Some(TestElement::named("root")));
	verifier.wait_settled(SETTLE).await.unwrap();
	assert!(surface.is_expanded(&["a"]));
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn a_refetch_does_not_reexpand_a_collapsed_node() {
	let model = TestModel::new("root");
	model.add(&[], "a");
	model.add(&["a"], "a1");
	model.add(&["a", "a1"], "a2");
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();

	verifier.expect_sequences(1);
	coordinator.expand_to_level(test_path(&["a"]), -1);
	verifier.wait_settled(SETTLE).await.unwrap();
	assert!(surface.is_expanded(&["a", "a1"]));

	coordinator.collapse(test_path(&["a", "a1"]));
	verifier.expect_model_changes(1);
	verifier.expect_sequences(1);
	coordinator.apply_delta(model.refresh(&["a"]));
	verifier.wait_settled(SETTLE).await.unwrap();

	assert!(surface.is_expanded(&["a"]));
	assert!(!surface.is_expanded(&["a", "a1"]));
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn sibling_child_counts_batch_into_one_source_call() {
	let model = TestModel::new("root");
	model.add(&[], "a");
	model.add(&["a"], "a1");
	model.add(&[], "b");
	model.add(&["b"], "b1");
	model.enable_batching(KindClass::ChildCount);
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();
	assert_eq!(model.batch_call_count(), 0);

	// Auto-expanding fans out one count query per sibling in the same cycle.
	verifier.expect_sequences(1);
	coordinator.expand_to_level(TreePath::root(), -1);
	verifier.wait_settled(SETTLE).await.unwrap();

	assert_eq!(model.batch_call_count(), 1);
	assert_eq!(model.query_count(&["a"], KindClass::ChildCount), 1);
	assert_eq!(model.query_count(&["b"], KindClass::ChildCount), 1);
	assert_eq!(surface.child_names(&["a"]), vec!["a1"]);
	assert_eq!(surface.child_names(&["b"]), vec!["b1"]);
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}

#[tokio::test]
async fn collapse_undoes_an_expand() {
	let model = TestModel::new("root");
	model.add(&[], "a");
	model.add(&[], "b");
	model.add(&["a"], "a1");
	let (coordinator, surface, verifier) = start(&model);

	verifier.expect_sequences(1);
	coordinator.set_input(Some(model.root()));
	verifier.wait_settled(SETTLE).await.unwrap();

	verifier.expect_sequences(1);
	coordinator.expand(test_path(&["a"]));
	verifier.wait_settled(SETTLE).await.unwrap();
	assert!(surface.is_expanded(&["a"]));

	coordinator.collapse(test_path(&["a"]));
	// Barrier: a content refresh of a sibling flushes the collapse through the
	// coordination queue before asserting.
	verifier.expect_model_changes(1);
	verifier.expect_sequences(1);
	coordinator.apply_delta(model.refresh(&["b"]));
	verifier.wait_settled(SETTLE).await.unwrap();

	assert!(!surface.is_expanded(&["a"]));
	assert!(verifier.violations().is_empty(), "{:?}", verifier.violations());
}
