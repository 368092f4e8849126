use std::sync::{Arc, Mutex};

use super::*;
use crate::render::{BlitRect, GraphicsCall, RecordingBackend};
use crate::vr::math::eye_view_matrix;
use crate::vr::simulated::SimulatedState;
use crate::vr::{Extent, SimulatedHmd, SimulatedRuntime, TextureOrigin};
use approx::assert_relative_eq;
use glam::{Quat, Vec3};

type TestLoop = FrameLoop<SimulatedRuntime, RecordingBackend>;

struct Harness {
    frame_loop: TestLoop,
    calls: Arc<Mutex<Vec<GraphicsCall>>>,
    state: Arc<Mutex<SimulatedState>>,
}

const MIRROR: Extent = Extent { width: 320, height: 200 };

fn harness(texture_count: usize) -> Harness {
    let hmd = SimulatedHmd {
        eye_resolution: Extent::new(64, 72),
        texture_count,
        ..Default::default()
    };
    let runtime = SimulatedRuntime::new(hmd).expect("simulated HMD should start");
    let state = runtime.state_handle();
    let graphics = RecordingBackend::new();
    let calls = graphics.log_handle();
    let frame_loop = FrameLoop::new(runtime, graphics, SceneSettings::default(), MIRROR)
        .expect("frame loop should start");
    calls.lock().unwrap().clear();
    Harness { frame_loop, calls, state }
}

impl Harness {
    fn take_calls(&self) -> Vec<GraphicsCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn script(&self, statuses: &[SubmitStatus]) {
        self.state.lock().unwrap().scripted_statuses.extend(statuses.iter().copied());
    }
}

fn draw_count(calls: &[GraphicsCall]) -> usize {
    calls.iter().filter(|c| matches!(c, GraphicsCall::Draw { .. })).count()
}

fn assert_mat_eq(a: &Mat4, b: &Mat4) {
    for (x, y) in a.to_cols_array().iter().zip(b.to_cols_array().iter()) {
        assert_relative_eq!(x, y, epsilon = 0.0001);
    }
}

#[test_log::test]
fn test_visible_frame_renders_left_then_right() {
    let mut h = harness(3);
    let report = h.frame_loop.tick(0.016);

    assert_eq!(
        report.phases,
        vec![
            FramePhase::AcquirePose,
            FramePhase::RenderLeftEye,
            FramePhase::RenderRightEye,
            FramePhase::Submit,
            FramePhase::Mirror,
        ]
    );
    assert_eq!(report.draw_calls, 2);

    let order: Vec<&'static str> = h
        .take_calls()
        .iter()
        .map(|call| match call {
            GraphicsCall::Bind { eye: Eye::Left, .. } => "bind-left",
            GraphicsCall::Unbind { eye: Eye::Left } => "unbind-left",
            GraphicsCall::Bind { eye: Eye::Right, .. } => "bind-right",
            GraphicsCall::Unbind { eye: Eye::Right } => "unbind-right",
            GraphicsCall::Draw { .. } => "draw",
            GraphicsCall::Blit { .. } => "blit",
            GraphicsCall::Present => "present",
            _ => "other",
        })
        .collect();
    assert_eq!(
        order,
        vec![
            "bind-left",
            "draw",
            "unbind-left",
            "bind-right",
            "draw",
            "unbind-right",
            "blit",
            "present"
        ]
    );
}

#[test]
fn test_layer_viewports_cover_targets() {
    let mut h = harness(3);
    h.frame_loop.tick(0.016);

    let state = h.state.lock().unwrap();
    let layer = &state.submitted[0].layer;
    assert_eq!(layer.origin, TextureOrigin::TopLeft);
    for eye in Eye::ALL {
        let target = h.frame_loop.target(eye);
        let slot = layer.eye(eye);
        assert_eq!(slot.viewport, Viewport { x: 0, y: 0, width: 64, height: 72 });
        assert_eq!(slot.viewport.width, target.extent.width);
        assert_eq!(slot.texture, Some(target.current_texture()));
    }
}

#[test]
fn test_swap_index_tracks_frame_count() {
    for texture_count in 1..=4 {
        let mut h = harness(texture_count);
        for n in 1..=10usize {
            h.frame_loop.tick(0.01);
            for eye in Eye::ALL {
                assert_eq!(
                    h.frame_loop.target(eye).swap.current_index(),
                    n % texture_count,
                    "{:?} eye after {} frames with {} textures",
                    eye,
                    n,
                    texture_count
                );
            }
        }
    }
}

#[test_log::test]
fn test_single_failure_skips_exactly_one_frame() {
    let mut h = harness(3);
    h.script(&[SubmitStatus::NotVisible]);

    let first = h.frame_loop.tick(0.01);
    assert_eq!(first.draw_calls, 2, "the failing frame itself was rendered");
    assert_eq!(first.status, SubmitStatus::NotVisible);
    assert_eq!(first.visibility, Visibility::Suppressed);
    let index_after_first = h.frame_loop.target(Eye::Left).swap.current_index();
    h.take_calls();

    let second = h.frame_loop.tick(0.01);
    assert_eq!(second.draw_calls, 0);
    assert_eq!(
        second.phases,
        vec![FramePhase::AcquirePose, FramePhase::Submit, FramePhase::Mirror]
    );
    assert_eq!(second.visibility, Visibility::Visible);
    assert_eq!(
        h.frame_loop.target(Eye::Left).swap.current_index(),
        index_after_first,
        "suppressed frames must not advance the swap set"
    );
    let calls = h.take_calls();
    assert_eq!(draw_count(&calls), 0);
    assert!(!calls.iter().any(|c| matches!(c, GraphicsCall::Bind { .. })));

    let third = h.frame_loop.tick(0.01);
    assert_eq!(third.draw_calls, 2);
}

#[test]
fn test_suppression_lasts_until_a_success() {
    let mut h = harness(2);
    h.script(&[SubmitStatus::DisplayLost, SubmitStatus::NotVisible, SubmitStatus::NotVisible]);

    let draws: Vec<u32> = (0..5).map(|_| h.frame_loop.tick(0.01).draw_calls).collect();
    assert_eq!(draws, vec![2, 0, 0, 0, 2]);
}

#[test]
fn test_suppressed_frame_still_submits_and_mirrors() {
    let mut h = harness(3);
    h.script(&[SubmitStatus::NotVisible]);
    h.frame_loop.tick(0.01);
    h.take_calls();

    h.frame_loop.tick(0.01);
    let calls = h.take_calls();
    let (src, dst) = (BlitRect::new(0, 200, 320, 0), BlitRect::new(0, 0, 320, 200));
    assert_eq!(calls, vec![GraphicsCall::Blit { src, dst }, GraphicsCall::Present]);
    assert_eq!(h.state.lock().unwrap().submitted.len(), 2);
}

#[test]
fn test_long_run_keeps_submit_history_bounded() {
    let mut h = harness(3);
    for _ in 0..5_000 {
        h.frame_loop.tick(0.001);
        h.calls.lock().unwrap().clear();
    }
    let state = h.state.lock().unwrap();
    assert_eq!(state.submit_count, 5_000);
    assert!(state.submitted.len() <= crate::vr::simulated::SUBMIT_HISTORY);
}

#[test]
fn test_exit_request_is_reported() {
    let mut h = harness(3);
    h.script(&[SubmitStatus::ExitRequested]);
    let report = h.frame_loop.tick(0.01);
    assert!(report.exit_requested());
    assert_eq!(h.frame_loop.visibility(), Visibility::Suppressed);
}

#[test]
fn test_view_projection_follows_head_pose() {
    let mut h = harness(3);
    let head = Pose::new(Quat::from_rotation_y(0.3), Vec3::new(0.0, 0.2, 0.1));
    h.state.lock().unwrap().head_pose = Some(head);

    h.frame_loop.tick(0.01);
    let calls = h.take_calls();
    let draws: Vec<Mat4> = calls
        .iter()
        .filter_map(|c| match c {
            GraphicsCall::Draw { view_projection, .. } => Some(*view_projection),
            _ => None,
        })
        .collect();
    assert_eq!(draws.len(), 2);

    let settings = SceneSettings::default();
    let runtime = h.frame_loop.runtime();
    let descs = Eye::ALL.map(|eye| runtime.eye_render_desc(eye, runtime.default_eye_fov(eye)));
    let eye_poses = calc_eye_poses(&head, &descs);
    for eye in Eye::ALL {
        let i = eye.index();
        let expected = Projection::from_fov(&descs[i].fov, settings.near, settings.far).matrix()
            * eye_view_matrix(settings.player_position, &eye_poses[i]);
        assert_mat_eq(&draws[i], &expected);
    }

    let layer = h.frame_loop.layer();
    assert_eq!(layer.eye(Eye::Left).render_pose.orientation, head.orientation);
}

#[test]
fn test_world_transform_accumulates_time() {
    let mut h = harness(3);
    h.frame_loop.tick(0.25);
    h.frame_loop.tick(0.5);

    let calls = h.take_calls();
    let last_world = calls
        .iter()
        .rev()
        .find_map(|c| match c {
            GraphicsCall::Draw { world, .. } => Some(*world),
            _ => None,
        })
        .unwrap();
    assert_mat_eq(&last_world, &Transform::spinning_cube(0.75).to_matrix());
}

#[test]
fn test_layer_carries_sensor_sample_time() {
    let mut h = harness(3);
    for _ in 0..4 {
        h.frame_loop.tick(0.01);
    }
    let state = h.state.lock().unwrap();
    let last = state.submitted.back().unwrap();
    assert_eq!(last.frame_index, 3);
    assert_relative_eq!(last.layer.sensor_sample_time, state.now);
    assert_relative_eq!(state.now, 3.0 / 90.0, epsilon = 1e-9);
}

#[test]
fn test_startup_sizes_targets_and_recenters() {
    let runtime = SimulatedRuntime::new(SimulatedHmd {
        eye_resolution: Extent::new(100, 120),
        texture_count: 2,
        ..Default::default()
    })
    .unwrap();
    let state = runtime.state_handle();
    let graphics = RecordingBackend::new();
    let calls = graphics.log_handle();
    let settings = SceneSettings { pixel_density: 0.5, ..Default::default() };

    let frame_loop = FrameLoop::new(runtime, graphics, settings, MIRROR).unwrap();

    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            GraphicsCall::CreateTarget {
                eye: Eye::Left,
                extent: Extent::new(50, 60),
                texture_count: 2
            },
            GraphicsCall::CreateTarget {
                eye: Eye::Right,
                extent: Extent::new(50, 60),
                texture_count: 2
            },
            GraphicsCall::CreateMirror { extent: MIRROR },
        ]
    );
    assert_eq!(state.lock().unwrap().recenter_count, 1);
    assert_eq!(frame_loop.frame_index(), 0);
}

#[test]
fn test_teardown_runs_in_fixed_order() {
    let h = harness(3);
    let Harness { frame_loop, calls, state } = h;
    frame_loop.shutdown();

    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            GraphicsCall::DestroyTarget { eye: Eye::Left },
            GraphicsCall::DestroyTarget { eye: Eye::Right },
            GraphicsCall::DestroyMirror,
            GraphicsCall::ReleaseBuffers,
            GraphicsCall::ReleaseProgram,
        ]
    );
    assert!(state.lock().unwrap().shut_down);
}

#[test]
fn test_drop_tears_down_once() {
    let h = harness(3);
    let calls = h.calls.clone();
    drop(h);
    let destroyed = calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| matches!(c, GraphicsCall::DestroyMirror))
        .count();
    assert_eq!(destroyed, 1);
}

#[test]
fn test_startup_abort_releases_what_was_acquired() {
    let runtime = SimulatedRuntime::new(SimulatedHmd::default()).unwrap();
    let state = runtime.state_handle();
    let graphics = RecordingBackend::new().failing_target(Eye::Right);
    let calls = graphics.log_handle();

    let result = FrameLoop::new(runtime, graphics, SceneSettings::default(), MIRROR);
    assert!(result.is_err());

    let calls = calls.lock().unwrap();
    assert!(matches!(calls[0], GraphicsCall::CreateTarget { eye: Eye::Left, .. }));
    assert_eq!(
        calls[1..],
        [
            GraphicsCall::DestroyTarget { eye: Eye::Left },
            GraphicsCall::ReleaseBuffers,
            GraphicsCall::ReleaseProgram,
        ]
    );
    assert!(state.lock().unwrap().shut_down);
    assert_eq!(state.lock().unwrap().recenter_count, 0);
}
