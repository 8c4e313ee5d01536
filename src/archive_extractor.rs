use anyhow::{Context, Result};
use glob::Pattern;
use ingest_core::{Feed, FeedCatalog};
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use zip::ZipArchive;

/// Unpacks bulk download archives and sorts their documents into
/// `<inbox>/<feed name>/` so the directory source can find them.
pub struct ArchiveExtractor {
    download_dir: PathBuf,
    inbox_dir: PathBuf,
    routes: Vec<(String, Pattern)>,
    archive_count: Arc<AtomicUsize>,
    document_count: Arc<AtomicUsize>,
    unmatched_count: Arc<AtomicUsize>,
}

impl ArchiveExtractor {
    pub fn new(download_dir: PathBuf, inbox_dir: PathBuf, catalog: &FeedCatalog) -> Result<Self> {
        let routes = catalog
            .feeds()
            .map(|feed| Ok((feed.name().to_string(), filename_pattern(feed)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            download_dir,
            inbox_dir,
            routes,
            archive_count: Arc::new(AtomicUsize::new(0)),
            document_count: Arc::new(AtomicUsize::new(0)),
            unmatched_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn extract_all(&self) -> Result<usize> {
        fs::create_dir_all(&self.inbox_dir)?;

        let archives = self.find_archives()?;
        println!("📦 Found {} archives in {}", archives.len(), self.download_dir.display());

        archives.par_iter().for_each(|archive| {
            if let Err(e) = self.process_archive(archive) {
                eprintln!("  ❌ {}: {:#}", archive.display(), e);
            }

            let count = self.archive_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count % 50 == 0 {
                println!(
                    "  Processed {} archives, routed {} documents so far",
                    count,
                    self.document_count.load(Ordering::SeqCst)
                );
            }
        });

        let routed = self.document_count.load(Ordering::SeqCst);
        println!("\n✅ Extraction complete");
        println!("  Archives:  {}", self.archive_count.load(Ordering::SeqCst));
        println!("  Documents: {} → {}", routed, self.inbox_dir.display());
        let unmatched = self.unmatched_count.load(Ordering::SeqCst);
        if unmatched > 0 {
            println!("  ⚠️  {} files matched no feed and were left out", unmatched);
        }
        Ok(routed)
    }

    /// Feed whose file pattern matches a document name.
    pub fn route(&self, file_name: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(_, pattern)| pattern.matches(file_name))
            .map(|(feed, _)| feed.as_str())
    }

    fn find_archives(&self) -> Result<Vec<PathBuf>> {
        let mut archives: Vec<PathBuf> = walkdir::WalkDir::new(&self.download_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|path| path.is_file() && has_extension(path, "zip"))
            // Single-document downloads are read in place by the directory source
            .filter(|path| {
                let name = file_name(path);
                self.route(&name).is_none()
            })
            .collect();
        archives.sort();
        Ok(archives)
    }

    fn process_archive(&self, archive: &Path) -> Result<()> {
        let temp_dir = TempDir::new_in(&self.inbox_dir)?;
        extract_recursive(archive, temp_dir.path())?;
        self.route_documents(temp_dir.path())
    }

    fn route_documents(&self, dir: &Path) -> Result<()> {
        for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() || !(has_extension(path, "xml") || has_extension(path, "csv")) {
                continue;
            }

            let name = file_name(path);
            let Some(feed) = self.route(&name) else {
                self.unmatched_count.fetch_add(1, Ordering::SeqCst);
                continue;
            };

            let feed_dir = self.inbox_dir.join(feed);
            fs::create_dir_all(&feed_dir)?;
            let dest = feed_dir.join(&name);
            if dest.exists() {
                fs::remove_file(&dest)?;
            }
            fs::rename(path, &dest)
                .with_context(|| format!("Failed to move {} into {}", name, feed_dir.display()))?;
            self.document_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Glob over document names with every placeholder left open.
pub fn filename_pattern(feed: &Feed) -> Result<Pattern> {
    let pattern = feed
        .config
        .file_pattern
        .replace("{date}", "*")
        .replace("{area}", "*")
        .replace("{variant}", "*");
    Pattern::new(&pattern)
        .with_context(|| format!("Invalid file pattern for feed {}: {}", feed.name(), pattern))
}

fn extract_recursive(zip_path: &Path, extract_to: &Path) -> Result<()> {
    let file = fs::File::open(zip_path)
        .with_context(|| format!("Failed to open ZIP file: {:?}", zip_path))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("Failed to read ZIP archive: {:?}", zip_path))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        // Entries escaping the extraction root are dropped
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        let outpath = extract_to.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = fs::File::create(&outpath)?;
        io::copy(&mut entry, &mut outfile)?;
        drop(outfile);

        if has_extension(&outpath, "zip") {
            if let Err(e) = extract_recursive(&outpath, extract_to) {
                eprintln!("  ⚠️  Failed to extract nested ZIP {:?}: {}", outpath, e);
            }
        }
    }
    Ok(())
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case(ext))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn extract_downloads(download_dir: PathBuf, inbox_dir: PathBuf, catalog: &FeedCatalog) -> Result<usize> {
    let extractor = ArchiveExtractor::new(download_dir, inbox_dir, catalog)?;
    extractor.extract_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
        for (name, bytes) in entries {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_routes_documents_by_feed_pattern() {
        let catalog = FeedCatalog::embedded().unwrap();
        let downloads = TempDir::new().unwrap();
        let inbox = TempDir::new().unwrap();

        write_zip(
            &downloads.path().join("january_bundle.zip"),
            &[
                ("data_AktualniSystemovaOdchylkaCR_20260104.csv", b"a"),
                ("gen/entsoe_generation_CZ_20260104.xml", b"<x/>"),
                ("readme.txt", b"ignored"),
                ("notes.csv", b"unmatched"),
            ],
        );

        let extractor =
            ArchiveExtractor::new(downloads.path().to_path_buf(), inbox.path().to_path_buf(), &catalog)
                .unwrap();
        let routed = extractor.extract_all().unwrap();

        assert_eq!(routed, 2);
        assert!(inbox
            .path()
            .join("ceps_imbalance/data_AktualniSystemovaOdchylkaCR_20260104.csv")
            .is_file());
        assert!(inbox
            .path()
            .join("entsoe_generation/entsoe_generation_CZ_20260104.xml")
            .is_file());
        assert_eq!(extractor.unmatched_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_document_zips_are_not_bundles() {
        let catalog = FeedCatalog::embedded().unwrap();
        let downloads = TempDir::new().unwrap();
        let inbox = TempDir::new().unwrap();
        write_zip(
            &downloads.path().join("entsoe_imbalance_prices_20260104.xml.zip"),
            &[("doc.xml", b"<x/>")],
        );

        let extractor =
            ArchiveExtractor::new(downloads.path().to_path_buf(), inbox.path().to_path_buf(), &catalog)
                .unwrap();
        assert!(extractor.find_archives().unwrap().is_empty());
        assert_eq!(
            extractor.route("entsoe_load_actual_CZ_20260104.xml"),
            Some("entsoe_load")
        );
        assert_eq!(
            extractor.route("entsoe_gen_forecast_CZ_20260104.xml"),
            Some("entsoe_generation_forecast")
        );
        assert_eq!(
            extractor.route("entsoe_flow_CZ_de_export_20260104.xml"),
            Some("entsoe_cross_border_flows")
        );
    }
}
