//! Channel geometry: a closed polygon whose edges carry boundary-condition tags.
//!
//! Every polygon edge is exactly one [`BoundarySegment`], so tags partition the boundary by
//! construction once [`Domain::new`] has accepted the input.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Boundary condition attached to a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundaryTag {
    /// Prescribed inflow velocity (Dirichlet).
    Inlet,
    /// Reference pressure + zero normal gradient of the normal velocity.
    Outlet,
    /// No-slip.
    Wall,
}

/// One tagged polygon edge, from `vertices[start]` to `vertices[end]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundarySegment {
    pub start: usize,
    pub end: usize,
    pub tag: BoundaryTag,
    #[serde(default)]
    pub label: String,
}

/// Raw geometry as imported (e.g. from JSON); validated into a [`Domain`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub vertices: Vec<[f64; 2]>,
    pub segments: Vec<BoundarySegment>,
}

/// A validated 2-D flow domain.
///
/// Vertices are stored counter-clockwise (clockwise input is reversed together with the
/// segment indices), so the interior is always on the left of each edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DomainSpec", into = "DomainSpec")]
pub struct Domain {
    vertices: Vec<[f64; 2]>,
    /// `segments[i]` is the edge `vertices[i] -> vertices[(i + 1) % n]`.
    segments: Vec<BoundarySegment>,
    area: f64,
    perimeter: f64,
}

impl TryFrom<DomainSpec> for Domain {
    type Error = Error;

    fn try_from(spec: DomainSpec) -> Result<Self> {
        Domain::new(spec.vertices, spec.segments)
    }
}

impl From<Domain> for DomainSpec {
    fn from(d: Domain) -> Self {
        DomainSpec {
            vertices: d.vertices,
            segments: d.segments,
        }
    }
}

#[inline]
fn sub(a: [f64; 2], b: [f64; 2]) -> [f64; 2] {
    [a[0] - b[0], a[1] - b[1]]
}

#[inline]
fn cross(a: [f64; 2], b: [f64; 2]) -> f64 {
    a[0] * b[1] - a[1] * b[0]
}

#[inline]
fn norm(a: [f64; 2]) -> f64 {
    (a[0] * a[0] + a[1] * a[1]).sqrt()
}

fn orient(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    cross(sub(b, a), sub(c, a))
}

/// Proper or touching intersection of closed segments `ab` and `cd`.
fn segments_intersect(a: [f64; 2], b: [f64; 2], c: [f64; 2], d: [f64; 2], eps: f64) -> bool {
    let o1 = orient(a, b, c);
    let o2 = orient(a, b, d);
    let o3 = orient(c, d, a);
    let o4 = orient(c, d, b);
    if ((o1 > eps && o2 < -eps) || (o1 < -eps && o2 > eps))
        && ((o3 > eps && o4 < -eps) || (o3 < -eps && o4 > eps))
    {
        return true;
    }
    let on_segment = |p: [f64; 2], q: [f64; 2], r: [f64; 2]| {
        r[0] >= p[0].min(q[0]) - eps
            && r[0] <= p[0].max(q[0]) + eps
            && r[1] >= p[1].min(q[1]) - eps
            && r[1] <= p[1].max(q[1]) + eps
    };
    (o1.abs() <= eps && on_segment(a, b, c))
        || (o2.abs() <= eps && on_segment(a, b, d))
        || (o3.abs() <= eps && on_segment(c, d, a))
        || (o4.abs() <= eps && on_segment(c, d, b))
}

impl Domain {
    /// Validate and build a domain.
    ///
    /// Fails with [`Error::GeometryInvalid`] when the polygon has fewer than three vertices,
    /// non-finite or repeated consecutive vertices, zero area, self-intersections, or when the
    /// segment list does not cover every edge exactly once (or lacks an inlet or an outlet).
    pub fn new(vertices: Vec<[f64; 2]>, segments: Vec<BoundarySegment>) -> Result<Self> {
        let n = vertices.len();
        if n < 3 {
            return Err(Error::GeometryInvalid(format!(
                "polygon needs at least 3 vertices, got {n}"
            )));
        }
        if vertices.iter().any(|v| !v[0].is_finite() || !v[1].is_finite()) {
            return Err(Error::GeometryInvalid("vertices must be finite".into()));
        }

        let mut perimeter = 0.0;
        let mut twice_area = 0.0;
        for i in 0..n {
            let a = vertices[i];
            let b = vertices[(i + 1) % n];
            let len = norm(sub(b, a));
            if len == 0.0 {
                return Err(Error::GeometryInvalid(format!(
                    "edge {i} has zero length (repeated vertex; the polygon closes implicitly)"
                )));
            }
            perimeter += len;
            twice_area += cross(a, b);
        }
        let scale = perimeter * perimeter;
        if twice_area.abs() <= 1e-12 * scale {
            return Err(Error::GeometryInvalid("polygon has zero area".into()));
        }

        // Non-adjacent edges must not touch.
        let eps = 1e-12 * scale;
        for i in 0..n {
            for j in (i + 1)..n {
                let adjacent = j == i + 1 || (i == 0 && j == n - 1);
                if adjacent {
                    continue;
                }
                if segments_intersect(
                    vertices[i],
                    vertices[(i + 1) % n],
                    vertices[j],
                    vertices[(j + 1) % n],
                    eps,
                ) {
                    return Err(Error::GeometryInvalid(format!(
                        "polygon self-intersects (edges {i} and {j})"
                    )));
                }
            }
        }

        // Each edge gets exactly one segment.
        let mut by_edge: Vec<Option<BoundarySegment>> = vec![None; n];
        for seg in segments {
            if seg.start >= n || seg.end >= n {
                return Err(Error::GeometryInvalid(format!(
                    "segment {:?} references a vertex outside 0..{n}",
                    seg.label
                )));
            }
            let edge = if seg.end == (seg.start + 1) % n {
                seg.start
            } else if seg.start == (seg.end + 1) % n {
                seg.end
            } else {
                return Err(Error::GeometryInvalid(format!(
                    "segment {:?} ({} -> {}) is not a polygon edge",
                    seg.label, seg.start, seg.end
                )));
            };
            if by_edge[edge].is_some() {
                return Err(Error::GeometryInvalid(format!(
                    "edge {edge} is tagged more than once"
                )));
            }
            by_edge[edge] = Some(BoundarySegment {
                start: edge,
                end: (edge + 1) % n,
                ..seg
            });
        }
        let mut segs = Vec::with_capacity(n);
        for (i, s) in by_edge.into_iter().enumerate() {
            match s {
                Some(s) => segs.push(s),
                None => {
                    return Err(Error::GeometryInvalid(format!(
                        "edge {i} has no boundary tag (tags must cover the whole boundary)"
                    )))
                }
            }
        }
        if !segs.iter().any(|s| s.tag == BoundaryTag::Inlet) {
            return Err(Error::GeometryInvalid("no inlet segment".into()));
        }
        if !segs.iter().any(|s| s.tag == BoundaryTag::Outlet) {
            return Err(Error::GeometryInvalid("no outlet segment".into()));
        }

        let (vertices, segs) = if twice_area < 0.0 {
            // Reverse to counter-clockwise: new edge k runs new[k] -> new[k+1].
            let rev: Vec<[f64; 2]> = vertices.iter().rev().copied().collect();
            let mut rsegs = Vec::with_capacity(n);
            for k in 0..n {
                // new[k] = old[n-1-k], new[k+1] = old[n-2-k]  => old edge (n-2-k).
                let old_edge = (2 * n - 2 - k) % n;
                rsegs.push(BoundarySegment {
                    start: k,
                    end: (k + 1) % n,
                    ..segs[old_edge].clone()
                });
            }
            (rev, rsegs)
        } else {
            (vertices, segs)
        };

        Ok(Self {
            vertices,
            segments: segs,
            area: 0.5 * twice_area.abs(),
            perimeter,
        })
    }

    /// Straight channel `[0, length] × [0, width]`: inlet at `x = 0`, outlet at `x = length`.
    pub fn rectangle(length: f64, width: f64) -> Result<Self> {
        if !(length > 0.0) || !(width > 0.0) || !length.is_finite() || !width.is_finite() {
            return Err(Error::GeometryInvalid(
                "channel length and width must be positive and finite".into(),
            ));
        }
        let vertices = vec![[0.0, 0.0], [length, 0.0], [length, width], [0.0, width]];
        let segments = vec![
            seg(0, 1, BoundaryTag::Wall, "WALL-bottom"),
            seg(1, 2, BoundaryTag::Outlet, "OUTLET"),
            seg(2, 3, BoundaryTag::Wall, "WALL-top"),
            seg(3, 0, BoundaryTag::Inlet, "INLET"),
        ];
        Self::new(vertices, segments)
    }

    /// T-junction: main channel `[0, main_length] × [0, width]` with a branch of the same width
    /// rising from the top wall, centred at `junction_x`, ending `branch_length` above it.
    ///
    /// Inlet on the left, outlets at the right end of the main channel and at the branch tip.
    pub fn t_junction(
        main_length: f64,
        branch_length: f64,
        width: f64,
        junction_x: f64,
    ) -> Result<Self> {
        if [main_length, branch_length, width, junction_x]
            .iter()
            .any(|x| !x.is_finite())
        {
            return Err(Error::GeometryInvalid(
                "T-junction dimensions must be finite".into(),
            ));
        }
        let hw = 0.5 * width;
        if !(width > 0.0) || !(branch_length > 0.0) {
            return Err(Error::GeometryInvalid(
                "branch length and width must be positive".into(),
            ));
        }
        if !(junction_x - hw > 0.0) || !(junction_x + hw < main_length) {
            return Err(Error::GeometryInvalid(
                "junction must lie strictly inside the main channel".into(),
            ));
        }
        let top = width + branch_length;
        let vertices = vec![
            [0.0, 0.0],
            [main_length, 0.0],
            [main_length, width],
            [junction_x + hw, width],
            [junction_x + hw, top],
            [junction_x - hw, top],
            [junction_x - hw, width],
            [0.0, width],
        ];
        let segments = vec![
            seg(0, 1, BoundaryTag::Wall, "WALL-bottom"),
            seg(1, 2, BoundaryTag::Outlet, "OUTLET1"),
            seg(2, 3, BoundaryTag::Wall, "WALL-top-right"),
            seg(3, 4, BoundaryTag::Wall, "WALL-branch-right"),
            seg(4, 5, BoundaryTag::Outlet, "OUTLET2"),
            seg(5, 6, BoundaryTag::Wall, "WALL-branch-left"),
            seg(6, 7, BoundaryTag::Wall, "WALL-top-left"),
            seg(7, 0, BoundaryTag::Inlet, "INLET"),
        ];
        Self::new(vertices, segments)
    }

    /// Symmetric Y-junction.
    ///
    /// An inlet channel `[0, inlet_length] × [-width/2, width/2]` splits into two branches of
    /// the same width, each leaving at `±angle_deg` to the x axis with outer walls of length
    /// `branch_length`. The inner walls meet on the centreline at the apex.
    pub fn y_junction(
        inlet_length: f64,
        branch_length: f64,
        width: f64,
        angle_deg: f64,
    ) -> Result<Self> {
        if [inlet_length, branch_length, width]
            .iter()
            .any(|&x| !(x > 0.0) || !x.is_finite())
        {
            return Err(Error::GeometryInvalid(
                "Y-junction lengths and width must be positive and finite".into(),
            ));
        }
        if !(angle_deg > 5.0 && angle_deg < 85.0) {
            return Err(Error::GeometryInvalid(
                "Y-junction branch angle must be in (5, 85) degrees".into(),
            ));
        }
        let a = angle_deg.to_radians();
        let (s, c) = a.sin_cos();
        let hw = 0.5 * width;

        let upper_outer = [inlet_length + branch_length * c, hw + branch_length * s];
        let upper_inner = [upper_outer[0] + width * s, upper_outer[1] - width * c];
        if !(upper_inner[1] > 0.0) {
            return Err(Error::GeometryInvalid(
                "Y-junction branches too short for their width".into(),
            ));
        }
        // Walk back along the inner wall until it reaches the centreline.
        let t = upper_inner[1] / s;
        let apex = [upper_inner[0] - t * c, 0.0];
        if !(apex[0] > inlet_length) {
            return Err(Error::GeometryInvalid(
                "Y-junction apex falls inside the inlet channel".into(),
            ));
        }
        let lower_outer = [upper_outer[0], -upper_outer[1]];
        let lower_inner = [upper_inner[0], -upper_inner[1]];

        let vertices = vec![
            [0.0, -hw],
            [inlet_length, -hw],
            lower_outer,
            lower_inner,
            apex,
            upper_inner,
            upper_outer,
            [inlet_length, hw],
            [0.0, hw],
        ];
        let segments = vec![
            seg(0, 1, BoundaryTag::Wall, "WALL-bottom"),
            seg(1, 2, BoundaryTag::Wall, "WALL-lower-outer"),
            seg(2, 3, BoundaryTag::Outlet, "OUTLET2"),
            seg(3, 4, BoundaryTag::Wall, "WALL-lower-inner"),
            seg(4, 5, BoundaryTag::Wall, "WALL-upper-inner"),
            seg(5, 6, BoundaryTag::Outlet, "OUTLET1"),
            seg(6, 7, BoundaryTag::Wall, "WALL-upper-outer"),
            seg(7, 8, BoundaryTag::Wall, "WALL-top"),
            seg(8, 0, BoundaryTag::Inlet, "INLET"),
        ];
        Self::new(vertices, segments)
    }

    pub fn vertices(&self) -> &[[f64; 2]] {
        &self.vertices
    }

    pub fn segments(&self) -> &[BoundarySegment] {
        &self.segments
    }

    pub fn area(&self) -> f64 {
        self.area
    }

    pub fn perimeter(&self) -> f64 {
        self.perimeter
    }

    /// Characteristic length `2·area/perimeter`.
    ///
    /// For a slender straight channel this is close to the channel width.
    pub fn characteristic_length(&self) -> f64 {
        2.0 * self.area / self.perimeter
    }

    /// `(min, max)` corners of the axis-aligned bounding box.
    pub fn bounding_box(&self) -> ([f64; 2], [f64; 2]) {
        let mut lo = [f64::INFINITY; 2];
        let mut hi = [f64::NEG_INFINITY; 2];
        for v in &self.vertices {
            for k in 0..2 {
                lo[k] = lo[k].min(v[k]);
                hi[k] = hi[k].max(v[k]);
            }
        }
        (lo, hi)
    }

    /// Largest absolute coordinate of any vertex.
    pub fn extent(&self) -> f64 {
        self.vertices
            .iter()
            .map(|v| v[0].abs().max(v[1].abs()))
            .fold(0.0, f64::max)
    }

    /// Endpoints of segment `i`.
    pub fn segment_points(&self, i: usize) -> ([f64; 2], [f64; 2]) {
        let s = &self.segments[i];
        (self.vertices[s.start], self.vertices[s.end])
    }

    pub fn segment_length(&self, i: usize) -> f64 {
        let (a, b) = self.segment_points(i);
        norm(sub(b, a))
    }

    /// Unit outward normal of segment `i`.
    pub fn outward_normal(&self, i: usize) -> [f64; 2] {
        let (a, b) = self.segment_points(i);
        let d = sub(b, a);
        let l = norm(d);
        // CCW polygon: the interior is on the left, so the outward normal is the right normal.
        [d[1] / l, -d[0] / l]
    }

    /// Even-odd point-in-polygon test. Points exactly on the boundary may go either way.
    pub fn contains(&self, p: [f64; 2]) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let vi = self.vertices[i];
            let vj = self.vertices[j];
            if (vi[1] > p[1]) != (vj[1] > p[1]) {
                let x_cross = vj[0] + (p[1] - vj[1]) * (vi[0] - vj[0]) / (vi[1] - vj[1]);
                if p[0] < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Distance from `p` to the closest boundary edge.
    pub fn distance_to_boundary(&self, p: [f64; 2]) -> f64 {
        let n = self.vertices.len();
        let mut best = f64::INFINITY;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            let ab = sub(b, a);
            let ap = sub(p, a);
            let t = ((ap[0] * ab[0] + ap[1] * ab[1]) / (ab[0] * ab[0] + ab[1] * ab[1]))
                .clamp(0.0, 1.0);
            let q = [a[0] + t * ab[0], a[1] + t * ab[1]];
            best = best.min(norm(sub(p, q)));
        }
        best
    }

    /// Whether vertex `i` is reentrant (interior angle above 180°).
    ///
    /// Reentrant corners are where branches leave a channel; velocity gradients are
    /// sharpest there.
    pub fn is_concave_vertex(&self, i: usize) -> bool {
        let n = self.vertices.len();
        let prev = self.vertices[(i + n - 1) % n];
        let cur = self.vertices[i];
        let next = self.vertices[(i + 1) % n];
        cross(sub(cur, prev), sub(next, cur)) < 0.0
    }

    /// Unit vector pointing into the domain along the angle bisector at vertex `i`.
    pub fn inward_bisector(&self, i: usize) -> [f64; 2] {
        let n = self.vertices.len();
        let prev = self.vertices[(i + n - 1) % n];
        let cur = self.vertices[i];
        let next = self.vertices[(i + 1) % n];
        let e1 = sub(cur, prev);
        let e2 = sub(next, cur);
        let (l1, l2) = (norm(e1), norm(e2));
        // Left normals point inside for a CCW polygon.
        let n1 = [-e1[1] / l1, e1[0] / l1];
        let n2 = [-e2[1] / l2, e2[0] / l2];
        let mut b = [n1[0] + n2[0], n1[1] + n2[1]];
        let lb = norm(b);
        if lb < 1e-9 {
            return n1;
        }
        // The normals' sum bisects the interior angle for convex and reentrant corners alike.
        b = [b[0] / lb, b[1] / lb];
        b
    }

    /// Indices of segments carrying `tag`.
    pub fn segments_tagged(&self, tag: BoundaryTag) -> impl Iterator<Item = usize> + '_ {
        self.segments
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.tag == tag)
            .map(|(i, _)| i)
    }
}

fn seg(start: usize, end: usize, tag: BoundaryTag, label: &str) -> BoundarySegment {
    BoundarySegment {
        start,
        end,
        tag,
        label: label.to_string(),
    }
}
