use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_size: Option<usize>,
    max_cached_size: Option<usize>,
    max_pages: Option<usize>,
    min_move_count: Option<usize>,
    max_move_count: Option<usize>,
    heap_growth_pages: Option<usize>,
    pool_block_size: Option<usize>,
}

#[derive(Deserialize)]
struct Bracket {
    limit: usize,
    align: usize,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default, rename = "bracket")]
    brackets: Vec<Bracket>,
}

struct ResolvedConfig {
    page_size: usize,
    page_shift: u32,
    max_cached_size: usize,
    max_pages: usize,
    min_move_count: usize,
    max_move_count: usize,
    heap_growth_pages: usize,
    pool_block_size: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let page_size = cfg.page_size.unwrap_or(8192);
    assert!(
        page_size.is_power_of_two(),
        "page_size ({}) must be a power of 2",
        page_size
    );
    assert!(
        (4096..=1 << 20).contains(&page_size),
        "page_size ({}) must be between 4 KiB and 1 MiB",
        page_size
    );

    let max_cached_size = cfg.max_cached_size.unwrap_or(256 * 1024);
    let max_pages = cfg.max_pages.unwrap_or(128);
    let min_move_count = cfg.min_move_count.unwrap_or(2);
    let max_move_count = cfg.max_move_count.unwrap_or(512);
    let heap_growth_pages = cfg.heap_growth_pages.unwrap_or(128);
    let pool_block_size = cfg.pool_block_size.unwrap_or(128 * 1024);

    assert!(max_cached_size > 0, "max_cached_size must be > 0");
    assert!(
        max_cached_size % page_size == 0,
        "max_cached_size ({}) must be a multiple of page_size ({})",
        max_cached_size,
        page_size
    );
    assert!(max_pages > 0, "max_pages must be > 0");
    assert!(min_move_count > 0, "min_move_count must be > 0");
    assert!(
        max_move_count >= min_move_count,
        "max_move_count ({}) must be >= min_move_count ({})",
        max_move_count,
        min_move_count
    );
    assert!(heap_growth_pages > 0, "heap_growth_pages must be > 0");
    assert!(
        pool_block_size >= page_size && pool_block_size % page_size == 0,
        "pool_block_size ({}) must be a non-zero multiple of page_size ({})",
        pool_block_size,
        page_size
    );

    ResolvedConfig {
        page_size,
        page_shift: page_size.trailing_zeros(),
        max_cached_size,
        max_pages,
        min_move_count,
        max_move_count,
        heap_growth_pages,
        pool_block_size,
    }
}

/// Mirrors `size_class::object_move_count` so the table can be checked here.
fn move_count(size: usize, cfg: &ResolvedConfig) -> usize {
    (cfg.max_cached_size / size).clamp(cfg.min_move_count, cfg.max_move_count)
}

/// Mirrors `size_class::page_move_count`.
fn page_count(size: usize, cfg: &ResolvedConfig) -> usize {
    (move_count(size, cfg) * size / cfg.page_size).max(1)
}

fn validate_brackets(brackets: &[Bracket], cfg: &ResolvedConfig) {
    assert!(
        !brackets.is_empty(),
        "TIERMALLOC_CONFIG: no alignment brackets defined"
    );

    let mut prev_limit = 0;
    for (i, b) in brackets.iter().enumerate() {
        assert!(
            b.align.is_power_of_two() && b.align >= 8,
            "bracket {}: align {} must be a power of 2 and >= 8",
            i,
            b.align
        );
        assert!(
            b.limit > prev_limit,
            "bracket {}: limit {} must be > previous limit {}",
            i,
            b.limit,
            prev_limit
        );
        assert!(
            b.limit % b.align == 0 && prev_limit % b.align == 0,
            "bracket {}: bounds ({}, {}] must be multiples of align {}",
            i,
            prev_limit,
            b.limit,
            b.align
        );

        let mut size = prev_limit + b.align;
        while size <= b.limit {
            let pages = page_count(size, cfg);
            assert!(
                pages * cfg.page_size >= size,
                "class size {} does not fit in its {}-page span",
                size,
                pages
            );
            assert!(
                pages <= cfg.max_pages,
                "class size {} needs {} pages, more than max_pages ({})",
                size,
                pages,
                cfg.max_pages
            );
            size += b.align;
        }

        prev_limit = b.limit;
    }

    assert_eq!(
        prev_limit, cfg.max_cached_size,
        "last bracket limit must equal max_cached_size"
    );
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/tiermalloc.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, brackets: &[Bracket], out_path: &Path) {
    let mut code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const PAGE_SIZE: usize = {};\n\
         pub const MAX_CACHED_SIZE: usize = {};\n\
         pub const MAX_PAGES: usize = {};\n\
         pub const MIN_MOVE_COUNT: usize = {};\n\
         pub const MAX_MOVE_COUNT: usize = {};\n\
         pub const HEAP_GROWTH_PAGES: usize = {};\n\
         pub const POOL_BLOCK_SIZE: usize = {};\n\n",
        cfg.page_shift,
        cfg.page_size,
        cfg.max_cached_size,
        cfg.max_pages,
        cfg.min_move_count,
        cfg.max_move_count,
        cfg.heap_growth_pages,
        cfg.pool_block_size,
    );

    code.push_str(&format!(
        "pub const ALIGN_BRACKETS: [AlignBracket; {}] = [\n",
        brackets.len()
    ));
    for b in brackets {
        code.push_str(&format!(
            "    AlignBracket {{ limit: {}, align: {} }},\n",
            b.limit, b.align
        ));
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=TIERMALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("TIERMALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    validate_brackets(&config.brackets, &resolved);

    generate_config(
        &resolved,
        &config.brackets,
        &Path::new(&out_dir).join("config_gen.rs"),
    );
}
