//! End-to-end meshing and contouring scenarios
use nalgebra::Vector3;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use trellis::{
    eval::FnShape,
    simplex::{Mesh, Settings, SimplexRoot},
    types::Interval,
    Region,
};

fn sphere(center: [f64; 3], r: f64) -> FnShape {
    let c = Vector3::from(center);
    FnShape::new(move |p| (p - c).norm_squared() - r * r)
        .with_gradient(move |p| 2.0 * (p - c))
        .with_interval(move |lo, up| {
            let (mut min, mut max) = (0.0, 0.0);
            for a in 0..3 {
                let (l, u) = (lo[a] - c[a], up[a] - c[a]);
                let far = l.abs().max(u.abs());
                let near = if l <= 0.0 && u >= 0.0 {
                    0.0
                } else {
                    l.abs().min(u.abs())
                };
                min += near * near;
                max += far * far;
            }
            Interval::new(min - r * r, max - r * r)
        })
}

fn cube(half: f64) -> FnShape {
    let argmax = |p: Vector3<f64>| {
        let a = p.map(f64::abs);
        if a.x >= a.y && a.x >= a.z {
            0
        } else if a.y >= a.z {
            1
        } else {
            2
        }
    };
    FnShape::new(move |p| p.map(f64::abs).max() - half)
        .with_gradient(move |p| {
            let mut g = Vector3::zeros();
            let i = argmax(p);
            g[i] = p[i].signum();
            g
        })
        .with_interval(move |lo, up| {
            let (mut min, mut max) = (f64::MIN, f64::MIN);
            for a in 0..3 {
                let (l, u) = (lo[a], up[a]);
                let far = l.abs().max(u.abs());
                let near = if l <= 0.0 && u >= 0.0 {
                    0.0
                } else {
                    l.abs().min(u.abs())
                };
                min = min.max(near);
                max = max.max(far);
            }
            Interval::new(min - half, max - half)
        })
}

/// Every directed edge must appear exactly once, paired with its reverse
fn check_edge_matching(mesh: &Mesh) -> Result<(), String> {
    let mut edges: BTreeMap<(u64, u64), usize> = BTreeMap::new();
    for t in &mesh.triangles {
        if t.x == t.y || t.y == t.z || t.x == t.z {
            return Err("triangle with duplicate vertices".to_owned());
        }
        for edge in [(t.x, t.y), (t.y, t.z), (t.z, t.x)] {
            *edges.entry(edge).or_default() += 1;
        }
    }
    for (&(a, b), &n) in &edges {
        if n != 1 {
            return Err(format!("directed edge ({a}, {b}) appears {n} times"));
        }
        if !edges.contains_key(&(b, a)) {
            return Err(format!("unpaired edge ({a}, {b})"));
        }
    }
    Ok(())
}

fn euler_characteristic(mesh: &Mesh) -> i64 {
    let mut verts: BTreeSet<u64> = BTreeSet::new();
    let mut edges: BTreeSet<(u64, u64)> = BTreeSet::new();
    for t in &mesh.triangles {
        for v in [t.x, t.y, t.z] {
            verts.insert(v);
        }
        for (a, b) in [(t.x, t.y), (t.y, t.z), (t.z, t.x)] {
            edges.insert((a.min(b), a.max(b)));
        }
    }
    verts.len() as i64 - edges.len() as i64 + mesh.triangles.len() as i64
}

/// Number of connected components of the triangle graph
fn component_count(mesh: &Mesh) -> usize {
    let mut parent: BTreeMap<u64, u64> = BTreeMap::new();
    fn find(parent: &mut BTreeMap<u64, u64>, mut v: u64) -> u64 {
        while parent[&v] != v {
            let up = parent[&parent[&v]];
            parent.insert(v, up);
            v = up;
        }
        v
    }
    for t in &mesh.triangles {
        for v in [t.x, t.y, t.z] {
            parent.entry(v).or_insert(v);
        }
        let a = find(&mut parent, t.x);
        for v in [t.y, t.z] {
            let b = find(&mut parent, v);
            parent.insert(b, a);
        }
    }
    let keys: Vec<u64> = parent.keys().copied().collect();
    keys.iter()
        .filter(|&&v| find(&mut parent, v) == v)
        .count()
}

#[test]
fn test_sphere_mesh() {
    let shape = sphere([0.0; 3], 1.0);
    let region = Region::new([-2.0; 3], [2.0; 3]);
    for workers in [0, 8] {
        let settings = Settings {
            min_feature: 0.1,
            workers,
            ..Settings::default()
        };
        let tree = SimplexRoot::build(&shape, region, settings).unwrap();
        let mesh = tree.walk_dual();
        assert!(!mesh.triangles.is_empty());

        if let Err(e) = check_edge_matching(&mesh) {
            panic!("{e} (with {workers} workers)");
        }
        assert_eq!(
            euler_characteristic(&mesh),
            2,
            "sphere is not a topological sphere ({workers} workers)"
        );

        // Outward orientation: each triangle's normal must agree with the
        // gradient at its centroid (skipping slivers whose normal direction
        // is numerically meaningless)
        for t in &mesh.triangles {
            let a = mesh.vertices[t.x as usize];
            let b = mesh.vertices[t.y as usize];
            let c = mesh.vertices[t.z as usize];
            let n = (b - a).cross(&(c - a));
            if n.norm() < 1e-12 {
                continue;
            }
            let centroid = (a + b + c) / 3.0;
            assert!(
                n.dot(&centroid) > 0.0,
                "inward-facing triangle at {centroid:?} ({workers} workers)"
            );
        }

        // Vertices stay near the unit sphere
        for t in &mesh.triangles {
            for v in [t.x, t.y, t.z] {
                let p = mesh.vertices[v as usize];
                assert!(
                    (p.norm() - 1.0).abs() < 0.05,
                    "vertex {p:?} is far from the sphere"
                );
            }
        }
    }
}

#[test]
fn test_cube_sharp_edges() {
    let shape = cube(1.0);
    let region = Region::new([-2.0; 3], [2.0; 3]);
    let settings = Settings {
        min_feature: 0.25,
        workers: 0,
        ..Settings::default()
    };
    let tree = SimplexRoot::build(&shape, region, settings).unwrap();
    let mesh = tree.walk_dual();

    check_edge_matching(&mesh).unwrap();
    assert_eq!(euler_characteristic(&mesh), 2);

    // Sharp features survive: some triangles face +x while others face +y,
    // a full quarter-turn apart
    let mut axis_hits = [false; 3];
    for t in &mesh.triangles {
        let a = mesh.vertices[t.x as usize];
        let b = mesh.vertices[t.y as usize];
        let c = mesh.vertices[t.z as usize];
        let n = (b - a).cross(&(c - a)).normalize();
        for (i, hit) in axis_hits.iter_mut().enumerate() {
            if n[i] > 0.99 {
                *hit = true;
            }
        }
    }
    assert_eq!(axis_hits, [true; 3], "missing axis-aligned faces");

    // Cube vertices stay on the surface
    for t in &mesh.triangles {
        for v in [t.x, t.y, t.z] {
            let p = mesh.vertices[v as usize];
            assert!(
                (p.map(f64::abs).max() - 1.0).abs() < 0.05,
                "vertex {p:?} is far from the cube"
            );
        }
    }
}

#[test]
fn test_two_spheres() {
    // Disjoint spheres at +/- 2 on the x axis
    let a = Vector3::new(2.0, 0.0, 0.0);
    let b = Vector3::new(-2.0, 0.0, 0.0);
    let dist = move |p: Vector3<f64>, c: Vector3<f64>| (p - c).norm_squared() - 1.0;
    let sphere_range = |lo: Vector3<f64>, up: Vector3<f64>, c: Vector3<f64>| {
        let (mut min, mut max) = (0.0, 0.0);
        for a in 0..3 {
            let (l, u) = (lo[a] - c[a], up[a] - c[a]);
            let far = l.abs().max(u.abs());
            let near = if l <= 0.0 && u >= 0.0 {
                0.0
            } else {
                l.abs().min(u.abs())
            };
            min += near * near;
            max += far * far;
        }
        (min - 1.0, max - 1.0)
    };
    let shape = FnShape::new(move |p| dist(p, a).min(dist(p, b)))
        .with_gradient(move |p| {
            let c = if dist(p, a) <= dist(p, b) { a } else { b };
            2.0 * (p - c)
        })
        .with_interval(move |lo, up| {
            let (min_a, max_a) = sphere_range(lo, up, a);
            let (min_b, max_b) = sphere_range(lo, up, b);
            Interval::new(min_a.min(min_b), max_a.min(max_b))
        });

    let region = Region::new([-4.0; 3], [4.0; 3]);
    let settings = Settings {
        min_feature: 0.2,
        workers: 0,
        ..Settings::default()
    };
    let tree = SimplexRoot::build(&shape, region, settings).unwrap();
    let mesh = tree.walk_dual();

    check_edge_matching(&mesh).unwrap();
    assert_eq!(component_count(&mesh), 2, "expected two shells");
    assert_eq!(euler_characteristic(&mesh), 4, "two spheres sum to chi = 4");

    // No triangle bridges the components
    for t in &mesh.triangles {
        let signs: Vec<bool> = [t.x, t.y, t.z]
            .iter()
            .map(|&v| mesh.vertices[v as usize].x > 0.0)
            .collect();
        assert!(
            signs.iter().all(|&s| s == signs[0]),
            "triangle spans both spheres"
        );
    }
}

#[test]
fn test_empty_region_mesh() {
    let shape =
        FnShape::new(|_| 1.0).with_interval(|_, _| Interval::new(1.0, 1.0));
    let region = Region::new([-2.0; 3], [2.0; 3]);
    let settings = Settings {
        min_feature: 0.5,
        workers: 0,
        ..Settings::default()
    };
    let tree = SimplexRoot::build(&shape, region, settings).unwrap();
    let mesh = tree.walk_dual();
    assert!(mesh.triangles.is_empty());
}

#[test]
fn test_abort_mid_build() {
    let shape = sphere([0.0; 3], 1.0);
    let region = Region::new([-2.0; 3], [2.0; 3]);
    let abort = AtomicBool::new(false);

    let tree = std::thread::scope(|s| {
        let h = s.spawn(|| {
            let settings = Settings {
                min_feature: 0.005,
                workers: 4,
                abort: Some(&abort),
                ..Settings::default()
            };
            SimplexRoot::build(&shape, region, settings).unwrap()
        });
        std::thread::sleep(std::time::Duration::from_millis(2));
        abort.store(true, Ordering::Relaxed);
        h.join().unwrap()
    });

    // Extraction still succeeds on the (possibly truncated) tree, and
    // nothing leaks
    let _ = tree.walk_dual();
    let pool = tree.recycle();
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.subspaces().outstanding(), 0);
}
