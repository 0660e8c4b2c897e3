//! 平面标记姿态估计 (Planar marker pose estimation)
//!
//! 角点 → 去畸变归一化坐标 → DLT单应矩阵 → 平面分解得到 R|t,
//! 旋转以Rodrigues向量表示。投影函数带完整5参数畸变模型,
//! 供坐标轴叠加绘制使用。

use anyhow::{bail, Result};
use ndarray::{arr1, arr2, Array1, Array2};

use crate::processing::CameraIntrinsics;
use crate::{Frame, Point2f};

/// 标记相对相机的姿态
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    /// Rodrigues旋转向量
    pub rvec: [f64; 3],
    /// 平移向量 (米)
    pub tvec: [f64; 3],
}

/// 由4个角点估计单个平面标记的姿态
///
/// 角点顺序: 左上, 右上, 右下, 左下 (图像坐标系, y向下)。
/// 物体坐标系原点位于标记中心, x向右, y沿图像向下方向, z指向相机外。
pub fn estimate_marker_pose(
    corners: &[Point2f; 4],
    marker_size_m: f64,
    intrinsics: &CameraIntrinsics,
) -> Result<Pose> {
    let half = marker_size_m / 2.0;
    let object: [[f64; 2]; 4] = [
        [-half, -half],
        [half, -half],
        [half, half],
        [-half, half],
    ];
    let normalized: Vec<[f64; 2]> = corners
        .iter()
        .map(|c| undistort_point(c, intrinsics))
        .collect();

    let h = homography_dlt(&object, &normalized)?;

    // 平面分解: H = [r1 r2 t] (归一化坐标系下)
    let h1 = arr1(&[h[(0, 0)], h[(1, 0)], h[(2, 0)]]);
    let h2 = arr1(&[h[(0, 1)], h[(1, 1)], h[(2, 1)]]);
    let h3 = arr1(&[h[(0, 2)], h[(1, 2)], h[(2, 2)]]);
    let n1 = norm(&h1);
    let n2 = norm(&h2);
    if n1 < 1e-12 || n2 < 1e-12 {
        bail!("单应矩阵退化");
    }
    let lambda = 2.0 / (n1 + n2);
    let mut r1 = h1 * lambda;
    let mut r2 = h2 * lambda;
    let mut t = h3 * lambda;

    // 标记必须位于相机前方
    if t[2] < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }

    // Gram-Schmidt正交化
    let n = norm(&r1);
    r1 = r1 / n;
    let proj = dot(&r1, &r2);
    r2 = r2 - &r1 * proj;
    let n = norm(&r2);
    if n < 1e-12 {
        bail!("旋转列退化");
    }
    r2 = r2 / n;
    let r3 = cross(&r1, &r2);

    let rotation = arr2(&[
        [r1[0], r2[0], r3[0]],
        [r1[1], r2[1], r3[1]],
        [r1[2], r2[2], r3[2]],
    ]);

    Ok(Pose {
        rvec: matrix_to_rvec(&rotation),
        tvec: [t[0], t[1], t[2]],
    })
}

/// 像素坐标去畸变并归一化 (迭代反解径向/切向畸变)
fn undistort_point(p: &Point2f, intrinsics: &CameraIntrinsics) -> [f64; 2] {
    let k = &intrinsics.matrix;
    let [k1, k2, p1, p2, k3] = intrinsics.dist_coeffs;
    let xd = (p.x as f64 - k[0][2]) / k[0][0];
    let yd = (p.y as f64 - k[1][2]) / k[1][1];
    let (mut x, mut y) = (xd, yd);
    for _ in 0..8 {
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        x = (xd - dx) / radial;
        y = (yd - dy) / radial;
    }
    [x, y]
}

/// 4点DLT求平面单应 (固定h33=1, 8x8线性方程组)
fn homography_dlt(object: &[[f64; 2]; 4], image: &[[f64; 2]]) -> Result<Array2<f64>> {
    let mut a = Array2::<f64>::zeros((8, 8));
    let mut b = Array1::<f64>::zeros(8);
    for i in 0..4 {
        let [gx, gy] = object[i];
        let [u, v] = image[i];
        a[(2 * i, 0)] = gx;
        a[(2 * i, 1)] = gy;
        a[(2 * i, 2)] = 1.0;
        a[(2 * i, 6)] = -gx * u;
        a[(2 * i, 7)] = -gy * u;
        b[2 * i] = u;
        a[(2 * i + 1, 3)] = gx;
        a[(2 * i + 1, 4)] = gy;
        a[(2 * i + 1, 5)] = 1.0;
        a[(2 * i + 1, 6)] = -gx * v;
        a[(2 * i + 1, 7)] = -gy * v;
        b[2 * i + 1] = v;
    }
    let h = solve_linear(&mut a, &mut b)?;
    Ok(arr2(&[
        [h[0], h[1], h[2]],
        [h[3], h[4], h[5]],
        [h[6], h[7], 1.0],
    ]))
}

/// 列主元高斯消元
fn solve_linear(a: &mut Array2<f64>, b: &mut Array1<f64>) -> Result<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[(i, col)].abs().partial_cmp(&a[(j, col)].abs()).unwrap())
            .unwrap_or(col);
        if a[(pivot, col)].abs() < 1e-12 {
            bail!("角点共线, 方程组奇异");
        }
        if pivot != col {
            for k in 0..n {
                let tmp = a[(col, k)];
                a[(col, k)] = a[(pivot, k)];
                a[(pivot, k)] = tmp;
            }
            b.swap(col, pivot);
        }
        for row in (col + 1)..n {
            let factor = a[(row, col)] / a[(col, col)];
            for k in col..n {
                a[(row, k)] -= factor * a[(col, k)];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in (row + 1)..n {
            sum -= a[(row, k)] * x[k];
        }
        x[row] = sum / a[(row, row)];
    }
    Ok(x)
}

/// Rodrigues向量 → 旋转矩阵
pub fn rvec_to_matrix(rvec: &[f64; 3]) -> Array2<f64> {
    let theta = (rvec[0] * rvec[0] + rvec[1] * rvec[1] + rvec[2] * rvec[2]).sqrt();
    if theta < 1e-12 {
        return Array2::eye(3);
    }
    let (x, y, z) = (rvec[0] / theta, rvec[1] / theta, rvec[2] / theta);
    let k = arr2(&[[0.0, -z, y], [z, 0.0, -x], [-y, x, 0.0]]);
    let k2 = k.dot(&k);
    Array2::eye(3) + &k * theta.sin() + &k2 * (1.0 - theta.cos())
}

/// 旋转矩阵 → Rodrigues向量 (θ接近π时精度下降, 标记正对场景不受影响)
pub fn matrix_to_rvec(r: &Array2<f64>) -> [f64; 3] {
    let trace = r[(0, 0)] + r[(1, 1)] + r[(2, 2)];
    let cos_theta = ((trace - 1.0) / 2.0).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();
    if theta < 1e-12 {
        return [0.0, 0.0, 0.0];
    }
    let scale = theta / (2.0 * theta.sin());
    [
        scale * (r[(2, 1)] - r[(1, 2)]),
        scale * (r[(0, 2)] - r[(2, 0)]),
        scale * (r[(1, 0)] - r[(0, 1)]),
    ]
}

/// 3D点投影到像素坐标 (含畸变)
pub fn project_points(
    points: &[[f64; 3]],
    pose: &Pose,
    intrinsics: &CameraIntrinsics,
) -> Vec<Point2f> {
    let r = rvec_to_matrix(&pose.rvec);
    let k = &intrinsics.matrix;
    let [k1, k2, p1, p2, k3] = intrinsics.dist_coeffs;
    points
        .iter()
        .map(|p| {
            let pc = r.dot(&arr1(p)) + arr1(&pose.tvec);
            let x = pc[0] / pc[2];
            let y = pc[1] / pc[2];
            let r2 = x * x + y * y;
            let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
            let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            Point2f::new(
                (k[0][0] * xd + k[0][2]) as f32,
                (k[1][1] * yd + k[1][2]) as f32,
            )
        })
        .collect()
}

/// 在帧上叠加姿态坐标轴: x红 y绿 z蓝
pub fn draw_axis(frame: &mut Frame, pose: &Pose, length: f64, intrinsics: &CameraIntrinsics) {
    let pts = project_points(
        &[
            [0.0, 0.0, 0.0],
            [length, 0.0, 0.0],
            [0.0, length, 0.0],
            [0.0, 0.0, -length],
        ],
        pose,
        intrinsics,
    );
    let origin = (pts[0].x, pts[0].y);
    crate::processing::stages::draw_segment(frame, origin, (pts[1].x, pts[1].y), [255, 0, 0]);
    crate::processing::stages::draw_segment(frame, origin, (pts[2].x, pts[2].y), [0, 255, 0]);
    crate::processing::stages::draw_segment(frame, origin, (pts[3].x, pts[3].y), [0, 0, 255]);
}

fn norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

fn dot(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.dot(b)
}

fn cross(a: &Array1<f64>, b: &Array1<f64>) -> Array1<f64> {
    arr1(&[
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            matrix: [[600.0, 0.0, 320.0], [0.0, 600.0, 240.0], [0.0, 0.0, 1.0]],
            dist_coeffs: [0.0; 5],
        }
    }

    fn marker_corners(pose: &Pose, size: f64, intr: &CameraIntrinsics) -> [Point2f; 4] {
        let half = size / 2.0;
        let pts = project_points(
            &[
                [-half, -half, 0.0],
                [half, -half, 0.0],
                [half, half, 0.0],
                [-half, half, 0.0],
            ],
            pose,
            intr,
        );
        [pts[0], pts[1], pts[2], pts[3]]
    }

    #[test]
    fn test_rodrigues_round_trip() {
        let rvec = [0.2, -0.4, 0.3];
        let r = rvec_to_matrix(&rvec);
        let back = matrix_to_rvec(&r);
        for i in 0..3 {
            assert!((back[i] - rvec[i]).abs() < 1e-9, "{:?} != {:?}", back, rvec);
        }
        // 零旋转
        assert_eq!(matrix_to_rvec(&Array2::eye(3)), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_project_center() {
        let pose = Pose {
            rvec: [0.0; 3],
            tvec: [0.0, 0.0, 1.0],
        };
        let pts = project_points(&[[0.0, 0.0, 0.0]], &pose, &test_intrinsics());
        assert!((pts[0].x - 320.0).abs() < 1e-4);
        assert!((pts[0].y - 240.0).abs() < 1e-4);
    }

    #[test]
    fn test_recover_frontal_pose() {
        let intr = test_intrinsics();
        let truth = Pose {
            rvec: [0.0; 3],
            tvec: [0.05, -0.02, 1.0],
        };
        let corners = marker_corners(&truth, 0.1, &intr);
        let pose = estimate_marker_pose(&corners, 0.1, &intr).unwrap();
        for i in 0..3 {
            assert!((pose.tvec[i] - truth.tvec[i]).abs() < 1e-3, "{:?}", pose);
            assert!(pose.rvec[i].abs() < 1e-3, "{:?}", pose);
        }
    }

    #[test]
    fn test_recover_rotated_pose() {
        let intr = test_intrinsics();
        let truth = Pose {
            rvec: [0.0, 0.3, 0.0],
            tvec: [0.0, 0.0, 0.8],
        };
        let corners = marker_corners(&truth, 0.145, &intr);
        let pose = estimate_marker_pose(&corners, 0.145, &intr).unwrap();
        for i in 0..3 {
            assert!(
                (pose.tvec[i] - truth.tvec[i]).abs() < 1e-2,
                "tvec {:?}",
                pose
            );
            assert!((pose.rvec[i] - truth.rvec[i]).abs() < 1e-2, "rvec {:?}", pose);
        }
    }

    #[test]
    fn test_undistort_round_trip() {
        let mut intr = test_intrinsics();
        intr.dist_coeffs = [-0.02, 0.03, -0.009, 0.003, -0.09];
        let pose = Pose {
            rvec: [0.0; 3],
            tvec: [0.02, 0.01, 1.0],
        };
        let projected = project_points(&[[0.03, -0.02, 0.0]], &pose, &intr);
        let [x, y] = undistort_point(&projected[0], &intr);
        // 去畸变后应还原为针孔投影坐标
        let expect_x = (0.03 + 0.02) / 1.0;
        let expect_y = (-0.02 + 0.01) / 1.0;
        assert!((x - expect_x).abs() < 1e-4, "x={} expect={}", x, expect_x);
        assert!((y - expect_y).abs() < 1e-4, "y={} expect={}", y, expect_y);
    }

    #[test]
    fn test_degenerate_corners_rejected() {
        let intr = test_intrinsics();
        // 四点共线
        let corners = [
            Point2f::new(100.0, 100.0),
            Point2f::new(120.0, 100.0),
            Point2f::new(140.0, 100.0),
            Point2f::new(160.0, 100.0),
        ];
        assert!(estimate_marker_pose(&corners, 0.1, &intr).is_err());
    }
}
