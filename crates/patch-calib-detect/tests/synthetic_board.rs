mod common;

use common::{draw_disc, max_error, SyntheticBoard};
use patch_calib_core::PatternSize;
use patch_calib_detect::{Confidence, FinderParams, PatternFinder, Rejection};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn finder(rows: usize, cols: usize) -> PatternFinder {
    let size = PatternSize::new(rows, cols).expect("size");
    PatternFinder::new(FinderParams::new(size)).expect("finder")
}

/// Errors of the interior and boundary lattice corners.
fn corner_errors(
    found: &[nalgebra::Point2<f32>],
    truth: &[nalgebra::Point2<f32>],
    size: PatternSize,
) -> (f32, f32) {
    let lattice = size.corner_grid();
    let (mut interior, mut boundary) = (0.0f32, 0.0f32);
    for i in 0..lattice.rows {
        for j in 0..lattice.cols {
            let k = lattice.index(i, j);
            let e = (found[k] - truth[k]).norm();
            let on_edge = i == 0 || j == 0 || i + 1 == lattice.rows || j + 1 == lattice.cols;
            if on_edge {
                boundary = boundary.max(e);
            } else {
                interior = interior.max(e);
            }
        }
    }
    (interior, boundary)
}

#[test]
fn detects_fronto_parallel_board() {
    init();
    let board = SyntheticBoard::new(4, 5);
    let r = board.render(320, 260);

    let det = finder(4, 5).find(&r.image.view()).expect("detection");
    assert!(!det.transposed);
    assert_eq!(det.size, PatternSize { rows: 4, cols: 5 });
    assert_eq!(det.centres.len(), 20);
    assert_eq!(det.corners.len(), 30);

    let centre_err = max_error(&det.centres, &r.centres);
    assert!(centre_err < 0.5, "centre error {centre_err}");

    let (interior, boundary) = corner_errors(&det.corners, &r.corners, det.size);
    assert!(interior < 0.75, "interior corner error {interior}");
    assert!(boundary < 0.75, "boundary corner error {boundary}");
    assert_eq!(det.confidence, Confidence::Nominal);
}

#[test]
fn detects_rotated_board_with_distractor() {
    init();
    let mut board = SyntheticBoard::new(5, 6);
    board.angle_deg = 6.0;
    board.origin = (80.0, 45.0);
    let mut r = board.render(400, 330);
    draw_disc(&mut r.image, 370.0, 305.0, 6.0);

    let det = finder(5, 6).find(&r.image.view()).expect("detection");
    let centre_err = max_error(&det.centres, &r.centres);
    assert!(centre_err < 0.75, "centre error {centre_err}");

    let (interior, boundary) = corner_errors(&det.corners, &r.corners, det.size);
    assert!(interior < 0.75, "interior corner error {interior}");
    assert!(boundary < 0.75, "boundary corner error {boundary}");
}

/// Mildly foreshortened 4x5 board: the far side is about 15% smaller.
fn perspective_board() -> SyntheticBoard {
    let mut board = SyntheticBoard::new(4, 5);
    board.perspective = (0.02, 0.015);
    board
}

#[test]
fn detects_board_under_perspective() {
    init();
    let r = perspective_board().render(320, 260);

    let det = finder(4, 5).find(&r.image.view()).expect("detection");
    assert_eq!(det.confidence, Confidence::Nominal);
    assert!(det.refinement.converged);
    let centre_err = max_error(&det.centres, &r.centres);
    assert!(centre_err < 0.75, "centre error {centre_err}");
    let (interior, boundary) = corner_errors(&det.corners, &r.corners, det.size);
    assert!(interior < 1.0, "interior corner error {interior}");
    assert!(boundary < 1.0, "boundary corner error {boundary}");
}

#[test]
fn refinement_iteration_cap_degrades_confidence() {
    init();
    let r = perspective_board().render(320, 260);
    let size = PatternSize::new(4, 5).expect("size");
    let mut params = FinderParams::new(size);
    params.refinement.max_iterations = 1;
    params.refinement.tolerance = 1e-6;

    let result = PatternFinder::new(params).expect("finder").find(&r.image.view());
    assert!(result.is_ok(), "{:?}", result.as_ref().err());
    let det = result.expect("detection");
    assert_eq!(det.confidence, Confidence::Degraded);
    assert_eq!(det.refinement.iterations, 1);
    assert!(!det.refinement.converged);
    assert!(det.refinement.max_shift >= 1e-6);
    assert_eq!(det.corners.len(), 30);
    assert!(max_error(&det.centres, &r.centres) < 0.75);
}

#[test]
fn board_rotated_a_quarter_turn_is_reported_transposed() {
    init();
    // The image shows 5 rows of 3 cells; the caller describes a 3x5 board.
    let board = SyntheticBoard::new(5, 3);
    let r = board.render(240, 320);

    let det = finder(3, 5).find(&r.image.view()).expect("detection");
    assert!(det.transposed);
    assert_eq!(det.size, PatternSize { rows: 5, cols: 3 });
    assert!(max_error(&det.centres, &r.centres) < 0.5);
}

#[test]
fn wrong_pattern_size_is_rejected() {
    init();
    let board = SyntheticBoard::new(4, 5);
    let r = board.render(320, 260);

    let err = finder(5, 5).find(&r.image.view()).unwrap_err();
    assert!(
        matches!(err, Rejection::InsufficientPatches { expected: 25, .. }),
        "{err}"
    );
}

#[test]
fn board_touching_border_is_out_of_frame() {
    init();
    let mut board = SyntheticBoard::new(3, 4);
    board.origin = (1.0, 40.0);
    let r = board.render(240, 200);

    let err = finder(3, 4).find(&r.image.view()).unwrap_err();
    assert!(matches!(err, Rejection::OutOfFrame { .. }), "{err}");
}
