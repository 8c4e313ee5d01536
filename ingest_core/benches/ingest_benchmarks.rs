use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ingest_core::{
    parser_for, AggregationEngine, Document, FeedCatalog, FineRow, TimeBasis, WideAssembler,
};

fn one_minute_day() -> String {
    let mut text = String::from(
        "Verze dat;Od;Do;Agregační funkce;Agregace;\n\
;04.01.2026 00:00:00;04.01.2026 23:59:59;agregace průměr;minuta;\n\
Datum;Aktuální odchylka [MW];\n",
    );
    for minute in 0..1440 {
        let value = ((minute as f64) * 0.37).sin() * 150.0;
        text.push_str(&format!(
            "04.01.2026 {:02}:{:02};{:.4};\n",
            minute / 60,
            minute % 60,
            value
        ));
    }
    text
}

fn benchmark_delimited_parse(c: &mut Criterion) {
    let catalog = FeedCatalog::embedded().unwrap();
    let feed = catalog.feed("ceps_imbalance").unwrap();
    let basis = TimeBasis::default();
    let doc = Document::new("bench.csv", one_minute_day().into_bytes());

    c.bench_function("parse_one_minute_day", |b| {
        let parser = parser_for(feed);
        b.iter(|| black_box(parser.parse(&doc, &basis).unwrap()));
    });
}

fn benchmark_generation_assembly(c: &mut Criterion) {
    let catalog = FeedCatalog::embedded().unwrap();
    let feed = catalog.feed("entsoe_generation").unwrap();
    let area = catalog.area_contexts(feed, Some(&[1])).remove(0);
    let basis = TimeBasis::default();

    let mut xml = String::from("<GL_MarketDocument>");
    for code in ["B01", "B02", "B04", "B05", "B10", "B11", "B12", "B14", "B16", "B19"] {
        xml.push_str(&format!(
            "<TimeSeries><MktPSRType><psrType>{}</psrType></MktPSRType><Period>\
             <timeInterval><start>2024-11-30T23:00Z</start><end>2024-12-01T23:00Z</end></timeInterval>\
             <resolution>PT15M</resolution>",
            code
        ));
        for position in (1..=96).step_by(3) {
            xml.push_str(&format!(
                "<Point><position>{}</position><quantity>{}</quantity></Point>",
                position,
                position * 10
            ));
        }
        xml.push_str("</Period></TimeSeries>");
    }
    xml.push_str("</GL_MarketDocument>");
    let doc = Document::new("bench.xml", xml.into_bytes());

    c.bench_function("parse_and_assemble_generation_day", |b| {
        let parser = parser_for(feed);
        b.iter(|| {
            let outcome = parser.parse(&doc, &basis).unwrap();
            let mut assembler = WideAssembler::new(feed);
            assembler.extend(&outcome.observations, &area);
            black_box(assembler.finish())
        });
    });
}

fn benchmark_aggregation(c: &mut Criterion) {
    let start = chrono::NaiveDate::from_ymd_opt(2026, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let rows: Vec<FineRow> = (0..7 * 1440)
        .map(|minute| FineRow {
            timestamp: start + chrono::Duration::minutes(minute),
            values: (0..5)
                .map(|col| Some(((minute + col) as f64 * 0.11).cos() * 80.0))
                .collect(),
        })
        .collect();
    let engine = AggregationEngine::new(5);

    c.bench_function("aggregate_week_of_minutes", |b| {
        b.iter(|| black_box(engine.aggregate(&rows)));
    });
}

criterion_group!(
    benches,
    benchmark_delimited_parse,
    benchmark_generation_assembly,
    benchmark_aggregation
);
criterion_main!(benches);
